use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use inventory_upsert_core::{InventoryStorage, StorageError};
use tracing::debug;

/// Read-through map from location to owning institution.
///
/// Loaded from storage on first use and again whenever a location is missing,
/// so locations added after start-up are picked up.
pub struct LocationCache {
    storage: Arc<dyn InventoryStorage>,
    institutions: RwLock<Option<HashMap<String, String>>>,
}

impl LocationCache {
    #[must_use]
    pub fn new(storage: Arc<dyn InventoryStorage>) -> Self {
        Self { storage, institutions: RwLock::new(None) }
    }

    /// Institution owning a location, if the location is known.
    ///
    /// # Errors
    /// Returns the storage error when the location table cannot be loaded.
    pub async fn institution_of(&self, location_id: &str) -> Result<Option<String>, StorageError> {
        if let Some(institution) = self.cached(location_id) {
            return Ok(Some(institution));
        }
        self.refresh().await?;
        Ok(self.cached(location_id))
    }

    /// Reload every location from storage.
    ///
    /// # Errors
    /// Returns the storage error when the location table cannot be loaded.
    pub async fn refresh(&self) -> Result<usize, StorageError> {
        let locations = self.storage.find_locations().await?;
        let map = locations
            .into_iter()
            .map(|location| (location.id, location.institution_id))
            .collect::<HashMap<_, _>>();
        let loaded = map.len();
        *self.institutions.write().unwrap_or_else(PoisonError::into_inner) = Some(map);
        debug!(loaded, "location cache refreshed");
        Ok(loaded)
    }

    fn cached(&self, location_id: &str) -> Option<String> {
        let guard = self.institutions.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref()?.get(location_id).cloned()
    }
}

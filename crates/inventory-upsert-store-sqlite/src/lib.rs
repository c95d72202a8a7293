use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use inventory_upsert_core::{
    EntityKind, InventoryStorage, Location, RecordId, StorageError, StoredRelation,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS instances (
  id TEXT PRIMARY KEY,
  hrid TEXT UNIQUE,
  match_key TEXT,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS holdings_records (
  id TEXT PRIMARY KEY,
  hrid TEXT NOT NULL UNIQUE,
  instance_id TEXT NOT NULL,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (instance_id) REFERENCES instances(id)
);

CREATE TABLE IF NOT EXISTS items (
  id TEXT PRIMARY KEY,
  hrid TEXT NOT NULL UNIQUE,
  holdings_record_id TEXT NOT NULL,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (holdings_record_id) REFERENCES holdings_records(id)
);

CREATE TABLE IF NOT EXISTS instance_relationships (
  id TEXT PRIMARY KEY,
  super_instance_id TEXT NOT NULL,
  sub_instance_id TEXT NOT NULL,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (super_instance_id) REFERENCES instances(id),
  FOREIGN KEY (sub_instance_id) REFERENCES instances(id)
);

CREATE TABLE IF NOT EXISTS preceding_succeeding_titles (
  id TEXT PRIMARY KEY,
  preceding_instance_id TEXT NOT NULL,
  succeeding_instance_id TEXT NOT NULL,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (preceding_instance_id) REFERENCES instances(id),
  FOREIGN KEY (succeeding_instance_id) REFERENCES instances(id)
);

CREATE INDEX IF NOT EXISTS idx_holdings_records_instance ON holdings_records(instance_id);
CREATE INDEX IF NOT EXISTS idx_items_holdings_record ON items(holdings_record_id);
CREATE INDEX IF NOT EXISTS idx_instance_relationships_super ON instance_relationships(super_instance_id);
CREATE INDEX IF NOT EXISTS idx_instance_relationships_sub ON instance_relationships(sub_instance_id);
CREATE INDEX IF NOT EXISTS idx_titles_preceding ON preceding_succeeding_titles(preceding_instance_id);
CREATE INDEX IF NOT EXISTS idx_titles_succeeding ON preceding_succeeding_titles(succeeding_instance_id);

CREATE TABLE IF NOT EXISTS locations (
  id TEXT PRIMARY KEY,
  institution_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_lines (
  id TEXT PRIMARY KEY,
  instance_id TEXT NOT NULL,
  document TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_instances_match_key ON instances(match_key);
CREATE INDEX IF NOT EXISTS idx_order_lines_instance ON order_lines(instance_id);
";


/// Table and indexed columns for one entity kind. Every kind keeps exactly two
/// indexed columns next to the JSON document.
struct TableSpec {
    table: &'static str,
    columns: [(&'static str, &'static str); 2],
}

fn table_spec(kind: EntityKind) -> TableSpec {
    match kind {
        EntityKind::Instance => TableSpec { table: "instances", columns: [("hrid", "hrid"), ("match_key", "matchKey")] },
        EntityKind::HoldingsRecord => TableSpec {
            table: "holdings_records",
            columns: [("hrid", "hrid"), ("instance_id", "instanceId")],
        },
        EntityKind::Item => {
            TableSpec { table: "items", columns: [("hrid", "hrid"), ("holdings_record_id", "holdingsRecordId")] }
        }
        EntityKind::InstanceRelationship => TableSpec {
            table: "instance_relationships",
            columns: [("super_instance_id", "superInstanceId"), ("sub_instance_id", "subInstanceId")],
        },
        EntityKind::TitleSuccession => TableSpec {
            table: "preceding_succeeding_titles",
            columns: [
                ("preceding_instance_id", "precedingInstanceId"),
                ("succeeding_instance_id", "succeedingInstanceId"),
            ],
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// `SQLite`-backed inventory storage. Documents are stored as JSON text next to
/// the columns lookups filter on.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open a `SQLite` inventory database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.connection()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the recorded version is newer than this build.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.connection()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&conn)? < 1 {
            apply_migration_1(&mut conn)?;
        }

        let version = current_schema_version(&conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Register a location and the institution that owns it.
    ///
    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn add_location(&self, id: &str, institution_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO locations(id, institution_id) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET institution_id = excluded.institution_id",
            params![id, institution_id],
        )
        .with_context(|| format!("failed to write location {id}"))?;
        Ok(())
    }

    /// Register a purchase order line referencing an instance.
    ///
    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn add_order_line(&self, id: &str, instance_id: &str) -> Result<Value> {
        let document = json!({"id": id, "instanceId": instance_id});
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO order_lines(id, instance_id, document, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, instance_id, document.to_string(), now_rfc3339()?],
        )
        .with_context(|| format!("failed to write order line {id}"))?;
        Ok(document)
    }

    fn write(&self, kind: EntityKind, document: &Value, mode: WriteMode) -> Result<String> {
        let spec = table_spec(kind);
        let id = document_field(document, "id")
            .ok_or_else(|| anyhow!("{kind} document has no id"))?;
        let [(first_column, first_field), (second_column, second_field)] = spec.columns;
        let sql = match mode {
            WriteMode::Insert => format!(
                "INSERT INTO {table}(id, {first_column}, {second_column}, document, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                table = spec.table
            ),
            WriteMode::Update => format!(
                "UPDATE {table} SET {first_column} = ?2, {second_column} = ?3, document = ?4, updated_at = ?5
                 WHERE id = ?1",
                table = spec.table
            ),
        };
        let conn = self.connection()?;
        let changed = conn
            .execute(
                &sql,
                params![
                    id,
                    document_field(document, first_field),
                    document_field(document, second_field),
                    document.to_string(),
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to write {kind} {id}"))?;
        if changed == 0 {
            return Err(anyhow!(StorageError::NotFound(format!("{kind} {id}"))));
        }
        Ok(id)
    }

    fn upsert_all(&self, kind: EntityKind, documents: &[Value]) -> Result<()> {
        let spec = table_spec(kind);
        let [(first_column, first_field), (second_column, second_field)] = spec.columns;
        let sql = format!(
            "INSERT INTO {table}(id, {first_column}, {second_column}, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
               {first_column} = excluded.{first_column},
               {second_column} = excluded.{second_column},
               document = excluded.document,
               updated_at = excluded.updated_at",
            table = spec.table
        );
        let now = now_rfc3339()?;
        let mut conn = self.connection()?;
        let tx = conn.transaction().context("failed to start batch transaction")?;
        for document in documents {
            let id = document_field(document, "id")
                .ok_or_else(|| anyhow!("{kind} document in batch has no id"))?;
            tx.execute(
                &sql,
                params![
                    id,
                    document_field(document, first_field),
                    document_field(document, second_field),
                    document.to_string(),
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert {kind} {id} in batch"))?;
        }
        tx.commit().context("failed to commit batch transaction")?;
        Ok(())
    }

    fn remove(&self, kind: EntityKind, id: &str) -> Result<()> {
        let spec = table_spec(kind);
        let conn = self.connection()?;
        let changed = conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", spec.table), params![id])
            .with_context(|| format!("failed to delete {kind} {id}"))?;
        if changed == 0 {
            return Err(anyhow!(StorageError::NotFound(format!("{kind} {id}"))));
        }
        Ok(())
    }

    fn query_documents(&self, sql: &str, args: &[&str]) -> Result<Vec<Value>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql).with_context(|| format!("failed to prepare query: {sql}"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
        let mut documents = Vec::new();
        for row in rows {
            let raw = row?;
            documents.push(serde_json::from_str(&raw).context("failed to decode stored document")?);
        }
        Ok(documents)
    }

    fn query_document(&self, sql: &str, args: &[&str]) -> Result<Option<Value>> {
        let conn = self.connection()?;
        let raw = conn
            .query_row(sql, rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to run query: {sql}"))?;
        raw.map(|raw| serde_json::from_str(&raw).context("failed to decode stored document"))
            .transpose()
    }

    fn list_locations(&self) -> Result<Vec<Location>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id, institution_id FROM locations ORDER BY id ASC")
            .context("failed to prepare locations query")?;
        let rows = stmt.query_map([], |row| {
            Ok(Location { id: row.get(0)?, institution_id: row.get(1)? })
        })?;
        let mut locations = Vec::new();
        for row in rows {
            locations.push(row?);
        }
        Ok(locations)
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Insert,
    Update,
}

#[async_trait]
impl InventoryStorage for SqliteStorage {
    async fn create(&self, kind: EntityKind, document: &Value) -> Result<RecordId, StorageError> {
        self.write(kind, document, WriteMode::Insert).map(RecordId).map_err(storage_error)
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, document: &Value) -> Result<(), StorageError> {
        if document_field(document, "id").as_deref() != Some(id.as_str()) {
            return Err(StorageError::Validation {
                status: 422,
                message: format!("{kind} document id does not match {id}"),
            });
        }
        self.write(kind, document, WriteMode::Update).map(|_| ()).map_err(storage_error)
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), StorageError> {
        self.remove(kind, id.as_str()).map_err(storage_error)
    }

    async fn find_by_natural_key(&self, kind: EntityKind, natural_key: &str) -> Result<Option<Value>, StorageError> {
        if kind.is_relation() {
            return Ok(None);
        }
        let sql = format!("SELECT document FROM {} WHERE hrid = ?1", table_spec(kind).table);
        self.query_document(&sql, &[natural_key]).map_err(storage_error)
    }

    async fn find_by_id(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Value>, StorageError> {
        let sql = format!("SELECT document FROM {} WHERE id = ?1", table_spec(kind).table);
        self.query_document(&sql, &[id.as_str()]).map_err(storage_error)
    }

    async fn find_by_parent_id(&self, kind: EntityKind, parent: &RecordId) -> Result<Vec<Value>, StorageError> {
        let sql = match kind {
            EntityKind::HoldingsRecord => {
                "SELECT document FROM holdings_records WHERE instance_id = ?1 ORDER BY hrid ASC"
            }
            EntityKind::Item => "SELECT document FROM items WHERE holdings_record_id = ?1 ORDER BY hrid ASC",
            EntityKind::Instance | EntityKind::InstanceRelationship | EntityKind::TitleSuccession => {
                return Ok(Vec::new());
            }
        };
        self.query_documents(sql, &[parent.as_str()]).map_err(storage_error)
    }

    async fn find_relations_by_instance_id(&self, id: &RecordId) -> Result<Vec<StoredRelation>, StorageError> {
        let mut relations = Vec::new();
        for kind in [EntityKind::InstanceRelationship, EntityKind::TitleSuccession] {
            let spec = table_spec(kind);
            let [(first, _), (second, _)] = spec.columns;
            let sql = format!(
                "SELECT document FROM {} WHERE {first} = ?1 OR {second} = ?1 ORDER BY id ASC",
                spec.table
            );
            let documents = self.query_documents(&sql, &[id.as_str()]).map_err(storage_error)?;
            relations.extend(documents.into_iter().map(|document| StoredRelation { kind, document }));
        }
        Ok(relations)
    }

    async fn find_locations(&self) -> Result<Vec<Location>, StorageError> {
        self.list_locations().map_err(storage_error)
    }

    async fn find_order_lines_by_instance_id(&self, id: &RecordId) -> Result<Vec<Value>, StorageError> {
        self.query_documents("SELECT document FROM order_lines WHERE instance_id = ?1 ORDER BY id ASC", &[
            id.as_str(),
        ])
        .map_err(storage_error)
    }

    async fn find_instance_by_match_key(&self, match_key: &str) -> Result<Option<Value>, StorageError> {
        self.query_document("SELECT document FROM instances WHERE match_key = ?1 ORDER BY id ASC LIMIT 1", &[
            match_key,
        ])
        .map_err(storage_error)
    }

    async fn find_instances_by_identifier(
        &self,
        identifier_type_id: &str,
        value: &str,
    ) -> Result<Vec<Value>, StorageError> {
        self.query_documents(
            "SELECT i.document FROM instances i
             WHERE EXISTS (
               SELECT 1 FROM json_each(i.document, '$.identifiers') AS e
               WHERE json_extract(e.value, '$.identifierTypeId') = ?1
                 AND json_extract(e.value, '$.value') = ?2
             )
             ORDER BY i.id ASC",
            &[identifier_type_id, value],
        )
        .map_err(storage_error)
    }

    async fn upsert_batch(&self, kind: EntityKind, documents: &[Value]) -> Result<(), StorageError> {
        debug!(kind = kind.as_str(), size = documents.len(), "sqlite batch upsert");
        self.upsert_all(kind, documents).map_err(|err| StorageError::BatchRejected {
            status: 422,
            message: format!("{err:#}"),
        })
    }
}

/// Classify a store failure: constraint violations are record rejections,
/// everything else is a transport fault.
fn storage_error(err: anyhow::Error) -> StorageError {
    if let Some(storage) = err.downcast_ref::<StorageError>() {
        return storage.clone();
    }
    let violation = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _)) if failure.code == ErrorCode::ConstraintViolation
        )
    });
    if violation {
        StorageError::Validation { status: 422, message: format!("{err:#}") }
    } else {
        StorageError::Transport(format!("{err:#}"))
    }
}

fn document_field(document: &Value, field: &str) -> Option<String> {
    match document.get(field)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn apply_migration_1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("failed to start migration v1 transaction")?;
    tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![1_i64, now_rfc3339()?],
    )
    .context("failed to record migration version 1")?;
    tx.commit().context("failed to commit migration v1")?;
    info!(version = 1, "applied sqlite migration");
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

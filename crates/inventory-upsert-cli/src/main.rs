use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use inventory_upsert_api::{open_sqlite_api, InventoryDatabase, InventoryUpsertApi, UpsertSettings};
use inventory_upsert_core::{ReportStatus, UpsertReport};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "iu")]
#[command(about = "Inventory record-set upsert CLI")]
struct Cli {
    #[arg(long, default_value = "./inventory.sqlite3")]
    db: PathBuf,

    /// YAML file with default processing instructions and item statuses.
    #[arg(long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Create or update one record set.
    Upsert(UpsertArgs),
    /// Create or update a JSON array of record sets.
    UpsertBatch(InputArgs),
    /// Delete one record set.
    Delete(UpsertArgs),
    /// Print the stored record set of an instance.
    Show(ShowArgs),
    Location {
        #[command(subcommand)]
        command: LocationCommand,
    },
    OrderLine {
        #[command(subcommand)]
        command: OrderLineCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct UpsertArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Match on the shared-index key and act for one institution only.
    #[arg(long, default_value_t = false)]
    shared: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    hrid: String,
}

#[derive(Debug, Subcommand)]
enum LocationCommand {
    Add(LocationAddArgs),
}

#[derive(Debug, Args)]
struct LocationAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    institution: String,
}

#[derive(Debug, Subcommand)]
enum OrderLineCommand {
    Add(OrderLineAddArgs),
}

#[derive(Debug, Args)]
struct OrderLineAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    instance_id: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<UpsertSettings> {
    let Some(path) = path else {
        return Ok(UpsertSettings::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse settings file {}", path.display()))
}

fn read_json(path: &Path) -> Result<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("request file {} is not valid JSON", path.display()))
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a report and map its status to the process exit code.
fn emit_report(report: &UpsertReport) -> Result<ExitCode> {
    emit_json(&serde_json::to_value(report)?)?;
    Ok(match report.status {
        ReportStatus::Ok | ReportStatus::PartialSuccess => ExitCode::SUCCESS,
        ReportStatus::NotFound | ReportStatus::BadRequest | ReportStatus::InternalError => {
            ExitCode::FAILURE
        }
    })
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let database = InventoryDatabase::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(command, &database),
        Command::Location { command: LocationCommand::Add(args) } => {
            database.add_location(&args.id, &args.institution)?;
            emit_json(&serde_json::json!({"id": args.id, "institutionId": args.institution}))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::OrderLine { command: OrderLineCommand::Add(args) } => {
            let order_line = database.add_order_line(&args.id, &args.instance_id)?;
            emit_json(&order_line)?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let settings = load_settings(cli.settings.as_deref())?;
            let api = open_sqlite_api(cli.db, settings)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_request(command, &api))
        }
    }
}

fn run_db(command: DbCommand, database: &InventoryDatabase) -> Result<ExitCode> {
    match command {
        DbCommand::SchemaVersion => {
            let status = database.schema_status()?;
            emit_json(&serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))?;
        }
        DbCommand::Migrate(args) => {
            let result = database.migrate(args.dry_run)?;
            emit_json(&serde_json::to_value(result)?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_request(command: Command, api: &InventoryUpsertApi) -> Result<ExitCode> {
    match command {
        Command::Upsert(args) => {
            let request = read_json(&args.input)?;
            let report = if args.shared {
                api.upsert_shared(&request).await
            } else {
                api.upsert(&request).await
            };
            emit_report(&report)
        }
        Command::UpsertBatch(args) => {
            let requests = match read_json(&args.input)? {
                Value::Array(requests) => requests,
                _ => return Err(anyhow!("{} must hold a JSON array of record sets", args.input.display())),
            };
            debug!(record_sets = requests.len(), "batch request loaded");
            emit_report(&api.upsert_batch(&requests).await)
        }
        Command::Delete(args) => {
            let request = read_json(&args.input)?;
            let report = if args.shared {
                api.delete_shared(&request).await
            } else {
                api.delete(&request).await
            };
            emit_report(&report)
        }
        Command::Show(args) => match api.show(&args.hrid).await? {
            Some(record_set) => {
                emit_json(&record_set)?;
                Ok(ExitCode::SUCCESS)
            }
            None => {
                emit_json(&serde_json::json!({"hrid": args.hrid, "found": false}))?;
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Db { .. } | Command::Location { .. } | Command::OrderLine { .. } => {
            Err(anyhow!("command does not operate on record sets"))
        }
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kvmigrate_api::{MigratorApi, API_CONTRACT_VERSION, APP_SCHEMA_VERSION};
use kvmigrate_core::Edition;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "kvmigrate")]
#[command(about = "Versioned data-model migrations for the embedded key-value store")]
struct Cli {
    #[arg(long, default_value = "./kvmigrate.sqlite3")]
    db: PathBuf,

    /// Edition stamped on the version record of a new installation.
    #[arg(long, default_value = "community", value_parser = parse_edition)]
    edition: Edition,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Version {
        #[command(subcommand)]
        command: VersionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Status(TargetArgs),
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long, default_value = APP_SCHEMA_VERSION)]
    target: String,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum VersionCommand {
    Show,
    SetInstanceId(SetInstanceIdArgs),
}

#[derive(Debug, Args)]
struct SetInstanceIdArgs {
    #[arg(long)]
    id: String,
}

fn parse_edition(raw: &str) -> Result<Edition, String> {
    Edition::parse(raw).ok_or_else(|| {
        format!("unknown edition `{raw}`; expected community, business, enterprise or a numeric code")
    })
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "cli_contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to encode command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), edition = %cli.edition, "opening database");

    let api = MigratorApi::new(cli.db, cli.edition);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Version { command } => run_version(command, &api),
    }
}

fn run_db(command: DbCommand, api: &MigratorApi) -> Result<()> {
    match command {
        DbCommand::Status(args) => emit_json(&api.status(&args.target)?),
        DbCommand::Migrate(args) => emit_json(&api.migrate(&args.target.target, args.dry_run)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(&serde_json::json!({
                "backup_file": args.out.display().to_string()
            }))
        }
    }
}

fn run_version(command: VersionCommand, api: &MigratorApi) -> Result<()> {
    match command {
        VersionCommand::Show => {
            let record = api.current_version()?;
            emit_json(&serde_json::json!({
                "schema_version": record.schema_version,
                "replay_count": record.replay_count,
                "edition": record.edition.as_str(),
                "edition_code": record.edition.code(),
                "instance_id": record.instance_id,
                "is_updating": api.is_updating()?,
                "app_schema_version": APP_SCHEMA_VERSION
            }))
        }
        VersionCommand::SetInstanceId(args) => {
            let record = api.set_instance_id(&args.id)?;
            emit_json(&serde_json::json!({
                "schema_version": record.schema_version,
                "instance_id": record.instance_id
            }))
        }
    }
}

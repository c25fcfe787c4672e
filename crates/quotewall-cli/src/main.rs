use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use quotewall_api::QuoteWallApi;
use quotewall_core::{CookieCodec, CookieKey};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "qw")]
#[command(about = "Quote wall administration CLI")]
struct Cli {
    #[arg(long, env = "QUOTEWALL_DB", default_value = "./quotewall.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Load conversations from an archive JSON file.
    Seed(DbSeedArgs),
    /// Write every conversation out as an archive JSON file.
    Export(DbExportArgs),
    /// Rebuild the daily rotation now. Running services switch to it on their
    /// next request.
    Reshuffle,
    /// Summarize recorded request timings per route.
    Metrics,
    Backup(DbBackupArgs),
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    /// Create a random cookie key, printed or written to a new file.
    Generate(KeyGenerateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbSeedArgs {
    #[arg(long)]
    src: PathBuf,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct KeyGenerateArgs {
    #[arg(long)]
    out: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            // Administrative commands never touch cookies, so any key will do.
            let api = QuoteWallApi::new(cli.db, CookieCodec::new(CookieKey::generate()));
            run_db(*command, &api)
        }
        Command::Key { command } => match command {
            KeyCommand::Generate(args) => run_key_generate(&args),
        },
    }
}

fn run_db(command: DbCommand, api: &QuoteWallApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(api),
        DbCommand::Migrate(args) => run_db_migrate(&args, api),
        DbCommand::Seed(args) => run_db_seed(&args, api),
        DbCommand::Export(args) => run_db_export(&args, api),
        DbCommand::Reshuffle => run_db_reshuffle(api),
        DbCommand::Metrics => run_db_metrics(api),
        DbCommand::Backup(args) => run_db_backup(&args, api),
    }
}

fn run_db_schema_version(api: &QuoteWallApi) -> Result<()> {
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, api: &QuoteWallApi) -> Result<()> {
    let result = api.migrate(args.dry_run)?;
    emit_json(serde_json::to_value(result)?)
}

fn run_db_seed(args: &DbSeedArgs, api: &QuoteWallApi) -> Result<()> {
    let summary = api.seed(&args.src)?;
    emit_json(serde_json::json!({
        "src": args.src.display().to_string(),
        "conversations": summary.conversations,
        "quotes": summary.quotes,
        "authors_created": summary.authors_created,
        "annotations_created": summary.annotations_created
    }))
}

fn run_db_export(args: &DbExportArgs, api: &QuoteWallApi) -> Result<()> {
    let digest = api.export(&args.out)?;
    emit_json(serde_json::to_value(digest)?)
}

fn run_db_reshuffle(api: &QuoteWallApi) -> Result<()> {
    let status = api.reshuffle()?;
    emit_json(serde_json::json!({
        "rotation_size": status.size,
        "built_on": status.built_on,
        "generation": status.generation
    }))
}

fn run_db_metrics(api: &QuoteWallApi) -> Result<()> {
    let routes = api.metrics()?;
    emit_json(serde_json::json!({ "routes": routes }))
}

fn run_db_backup(args: &DbBackupArgs, api: &QuoteWallApi) -> Result<()> {
    api.backup(&args.out)?;
    emit_json(serde_json::json!({
        "status": "ok",
        "backup_file": args.out.display().to_string()
    }))
}

fn run_key_generate(args: &KeyGenerateArgs) -> Result<()> {
    let key = CookieKey::generate().to_hex();
    let Some(out) = &args.out else {
        return emit_json(serde_json::json!({ "key": key }));
    };

    if out.exists() {
        return Err(anyhow!("key file already exists: {}", out.display()));
    }
    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create key directory {}", parent.display()))?;
    }
    fs::write(out, format!("{key}\n"))
        .with_context(|| format!("failed to write key file {}", out.display()))?;
    emit_json(serde_json::json!({ "status": "ok", "key_file": out.display().to_string() }))
}

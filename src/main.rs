use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;

use clinic_snapshot_lib::import::{write_operation_report, ImportMode, ImportOptions, OperationResult};
use clinic_snapshot_lib::service::{Identity, RestoreSnapshotRequest, Role, SnapshotService};
use clinic_snapshot_lib::{db, logging, migrate, AppError, RestoreMode, SnapshotConfig, SnapshotType};

const EXIT_FAILED: i32 = 1;
const EXIT_SETUP: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "clinic-snapshot",
    about = "Export, validate, restore and import clinic data snapshots",
    version
)]
struct Cli {
    /// SQLite database file. Defaults to the per-user data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Snapshot storage root. Overrides CLINIC_SNAPSHOT_STORAGE_DIR.
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
    /// Write restore and import reports into this directory.
    #[arg(long, global = true)]
    report_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TypeArg {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RestoreModeArg {
    Replace,
    Merge,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ImportModeArg {
    Create,
    Merge,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the live clinic schema migrations.
    MigrateDb,
    /// Print the discovered tenant tables and their FK order.
    Discover,
    /// Export a clinic into a stored snapshot.
    Export {
        #[arg(long)]
        clinic: String,
        #[arg(long = "type", value_enum, default_value = "manual")]
        snapshot_type: TypeArg,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// List the stored snapshots of a clinic.
    List {
        #[arg(long)]
        clinic: String,
    },
    /// Validate a bundle file (packed or plain JSON).
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
    /// Restore a stored snapshot into its own clinic.
    Restore {
        #[arg(long)]
        clinic: String,
        #[arg(long)]
        snapshot: String,
        #[arg(long, value_enum, default_value = "replace")]
        mode: RestoreModeArg,
        /// Skip the pre-restore backup.
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        dry_run: bool,
        /// Comma separated subset of tables.
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Import a bundle file into a new clinic.
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_enum, default_value = "create")]
        mode: ImportModeArg,
        /// Target workspace for merge imports.
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        /// Delete what was written if the import fails part-way.
        #[arg(long)]
        cleanup_on_failure: bool,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Delete a stored snapshot.
    Delete {
        #[arg(long)]
        clinic: String,
        #[arg(long)]
        snapshot: String,
    },
    /// Remove snapshots past the retention window.
    Cleanup {
        #[arg(long)]
        clinic: String,
    },
}

/// Failures before the requested operation could run.
struct SetupError(anyhow::Error);

fn main() {
    logging::init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: start async runtime: {err}");
            process::exit(EXIT_SETUP);
        }
    };
    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(SetupError(err)) => {
            eprintln!("Error: {err:#}");
            EXIT_SETUP
        }
    };
    process::exit(code);
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no per-user data directory on this platform")?;
    Ok(base.join("clinic-snapshot").join("clinic.sqlite3"))
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(err) => {
            eprintln!("Error: serialize output: {err}");
            EXIT_FAILED
        }
    }
}

fn print_error(err: AppError) -> i32 {
    print_json(&json!({ "error": &err, "retryable": err.is_retryable() }));
    EXIT_FAILED
}

fn print_operation(
    report_dir: Option<&Path>,
    kind: &str,
    source: &str,
    result: &OperationResult,
) -> i32 {
    if let Some(dir) = report_dir {
        match write_operation_report(dir, kind, source, result) {
            Ok(path) => eprintln!("Report written to {}", path.display()),
            Err(err) => eprintln!("Warning: {err:#}"),
        }
    }
    let code = print_json(result);
    if result.success {
        code
    } else {
        EXIT_FAILED
    }
}

fn identity(user: String, email: String) -> Identity {
    Identity {
        user_id: user,
        user_email: email,
        role: Role::Owner,
    }
}

async fn run(cli: Cli) -> Result<i32, SetupError> {
    let mut config = SnapshotConfig::from_env();
    if let Some(storage) = cli.storage {
        config.storage_root = storage;
    }
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().map_err(SetupError)?,
    };
    let pool = db::open_pool(&db_path).await.map_err(SetupError)?;

    if matches!(cli.command, Commands::MigrateDb) {
        let run = migrate::apply_migrations(&pool)
            .await
            .context("apply clinic schema migrations")
            .map_err(SetupError)?;
        let version = migrate::current_schema_version(&pool)
            .await
            .map_err(SetupError)?;
        pool.close().await;
        return Ok(print_json(&json!({
            "schemaVersion": version,
            "applied": run.applied,
            "alreadyApplied": run.already_applied,
        })));
    }

    let service = SnapshotService::with_fs_store(pool.clone(), config);
    let report_dir = cli.report_dir.as_deref();

    let code = match cli.command {
        Commands::MigrateDb => 0,
        Commands::Discover => match service.discover_tables(true).await {
            Ok(response) => print_json(&response),
            Err(err) => print_error(err),
        },
        Commands::Export {
            clinic,
            snapshot_type,
            user,
            email,
        } => {
            let snapshot_type = match snapshot_type {
                TypeArg::Manual => SnapshotType::Manual,
                TypeArg::Auto => SnapshotType::Auto,
            };
            match service
                .create_snapshot(&clinic, snapshot_type, &identity(user, email))
                .await
            {
                Ok(response) => print_json(&response),
                Err(err) => print_error(err),
            }
        }
        Commands::List { clinic } => match service.list_snapshots(&clinic).await {
            Ok(response) => print_json(&response),
            Err(err) => print_error(err),
        },
        Commands::Validate { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("read bundle {}", file.display()))
                .map_err(SetupError)?;
            match service.validate_bundle_bytes(&bytes) {
                Ok(result) => {
                    let code = print_json(&result);
                    if result.valid {
                        code
                    } else {
                        EXIT_FAILED
                    }
                }
                Err(err) => print_error(err),
            }
        }
        Commands::Restore {
            clinic,
            snapshot,
            mode,
            no_backup,
            dry_run,
            tables,
            overwrite,
            user,
            email,
        } => {
            let request = RestoreSnapshotRequest {
                mode: match mode {
                    RestoreModeArg::Replace => RestoreMode::Replace,
                    RestoreModeArg::Merge => RestoreMode::Merge,
                },
                create_backup_first: !no_backup,
                tables,
                dry_run,
                skip_validation: false,
                overwrite,
            };
            match service
                .restore_snapshot(&clinic, &snapshot, &request, &identity(user, email))
                .await
            {
                Ok(result) => print_operation(report_dir, "restore", &snapshot, &result),
                Err(err) => print_error(err),
            }
        }
        Commands::Import {
            file,
            mode,
            workspace,
            dry_run,
            tables,
            cleanup_on_failure,
            user,
            email,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("read bundle {}", file.display()))
                .map_err(SetupError)?;
            let options = ImportOptions {
                mode: match mode {
                    ImportModeArg::Create => ImportMode::Create,
                    ImportModeArg::Merge => ImportMode::Merge,
                },
                target_workspace_id: workspace,
                dry_run,
                tables,
                cleanup_on_failure,
                ..ImportOptions::default()
            };
            let who = identity(user, email);
            match service.import_bundle(&bytes, &options, Some(&who)).await {
                Ok(result) => print_operation(
                    report_dir,
                    "import",
                    &file.display().to_string(),
                    &result,
                ),
                Err(err) => print_error(err),
            }
        }
        Commands::Delete { clinic, snapshot } => {
            match service.delete_snapshot(&clinic, &snapshot).await {
                Ok(()) => print_json(&json!({ "deleted": snapshot })),
                Err(err) => print_error(err),
            }
        }
        Commands::Cleanup { clinic } => match service.cleanup(&clinic).await {
            Ok(removed) => print_json(&json!({ "removed": removed })),
            Err(err) => print_error(err),
        },
    };
    service.shutdown();
    pool.close().await;
    Ok(code)
}

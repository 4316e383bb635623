//! Strata inspection CLI
//!
//! Reads a datastore TOML configuration and answers questions about it:
//! whether its file categories are valid, how a name translates, what a
//! directory contains, and what the lineage ledger knows about a file.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use strata_datastore::{
    strata_home, CategoryRegistry, DatastoreConfig, FileLifecycleManager, LineageRecord,
    LineageStore, SqlPipelineTasks,
};
use strata_db::DbConnection;
use strata_logging::{datastore_span, init_logging, LogConfig};
use tracing::info;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Inspect a Strata datastore configuration")]
struct Cli {
    /// Datastore configuration file
    #[arg(short, long, env = "STRATA_CONFIG", default_value = "strata.toml")]
    config: PathBuf,

    /// Log debug events to stderr (STRATA_LOG overrides)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile and validate every file category
    Validate,

    /// Translate a working-directory name to its datastore path
    Translate {
        /// Category name
        category: String,

        /// Name to translate
        name: String,

        /// Translate a datastore path back to its working-directory name
        #[arg(short, long)]
        reverse: bool,
    },

    /// List category matches in a directory
    Scan {
        /// Directory to scan (relative to the datastore root with --datastore)
        dir: PathBuf,

        /// Walk the datastore tree instead of a flat working directory
        #[arg(long)]
        datastore: bool,
    },

    /// Show producer and consumers recorded for datastore files
    Lineage {
        /// Datastore-relative file names
        #[arg(required = true)]
        files: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Validate => "validate",
            Commands::Translate { .. } => "translate",
            Commands::Scan { .. } => "scan",
            Commands::Lineage { .. } => "lineage",
        }
    }
}

#[derive(Debug, Serialize)]
struct CategoryReport {
    name: String,
    working_dir_regex: String,
    datastore_template: String,
    datastore_regex: String,
    levels: usize,
}

fn load_registry(config: &DatastoreConfig) -> Result<CategoryRegistry> {
    config
        .registry()
        .context("Invalid file category configuration")
}

fn cmd_validate(config: &DatastoreConfig, json: bool, out: &mut impl Write) -> Result<()> {
    let registry = load_registry(config)?;
    let reports: Vec<CategoryReport> = registry
        .iter()
        .map(|category| CategoryReport {
            name: category.name().to_string(),
            working_dir_regex: category.working_dir_regex().to_string(),
            datastore_template: category.datastore_template().to_string(),
            datastore_regex: category.datastore_regex().to_string(),
            levels: category.datastore_levels(),
        })
        .collect();

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&reports)?)?;
    } else {
        for report in &reports {
            writeln!(out, "{}", report.name)?;
            writeln!(out, "  working dir: {}", report.working_dir_regex)?;
            writeln!(out, "  datastore:   {}", report.datastore_regex)?;
            writeln!(out, "  levels:      {}", report.levels)?;
        }
        writeln!(out, "{} categories OK", reports.len())?;
    }
    Ok(())
}

fn cmd_translate(
    config: &DatastoreConfig,
    category: &str,
    name: &str,
    reverse: bool,
    out: &mut impl Write,
) -> Result<()> {
    let registry = load_registry(config)?;
    let category = registry
        .get(category)
        .ok_or_else(|| anyhow!("Unknown file category: {}", category))?;
    let translated = if reverse {
        category.to_working_dir_name(name)
    } else {
        category.to_datastore_name(name)
    };
    let translated = translated
        .ok_or_else(|| anyhow!("'{}' does not match category {}", name, category.name()))?;
    writeln!(out, "{}", translated)?;
    Ok(())
}

fn cmd_scan(
    config: &DatastoreConfig,
    dir: &Path,
    datastore: bool,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let registry = load_registry(config)?;
    let categories: Vec<_> = registry.iter().collect();

    // No task context, so no reprocessing filter consults the ledger.
    let conn = DbConnection::open_sqlite_memory()?;
    let task_dir = if datastore {
        config.datastore_root.clone()
    } else {
        dir.to_path_buf()
    };
    let manager = FileLifecycleManager::from_config(
        config,
        task_dir,
        LineageStore::open(conn.clone())?,
        Arc::new(SqlPipelineTasks::open(conn)?),
    )?;

    let matches = if datastore {
        manager.datastore_files(dir, &categories)
    } else {
        manager.working_dir_files(&categories)
    }
    .with_context(|| format!("Failed to scan {}", dir.display()))?;
    info!(
        dir = %dir.display(),
        files = matches.values().map(BTreeSet::len).sum::<usize>(),
        "Scanned directory"
    );

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&matches)?)?;
    } else {
        for (category, files) in &matches {
            writeln!(out, "{} ({})", category, files.len())?;
            for file in files {
                writeln!(out, "  {}", file.display())?;
            }
        }
    }
    Ok(())
}

fn cmd_lineage(
    config: &DatastoreConfig,
    files: &[String],
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let conn = DbConnection::open_sqlite(&config.database_path).with_context(|| {
        format!(
            "Failed to open lineage database {}",
            config.database_path.display()
        )
    })?;
    let store = LineageStore::open(conn)?;
    let records = store.retrieve_or_create(files)?;

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
    } else {
        for record in &records {
            write_record(record, out)?;
        }
    }
    Ok(())
}

fn write_record(record: &LineageRecord, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", record.filename)?;
    if record.is_placeholder() {
        writeln!(out, "  (not recorded)")?;
        return Ok(());
    }
    writeln!(out, "  type:      {}", record.file_type)?;
    writeln!(out, "  producer:  {}", record.producer)?;
    let consumers: Vec<String> = record.consumers().iter().map(|t| t.to_string()).collect();
    writeln!(out, "  consumers: [{}]", consumers.join(", "))?;
    let no_output: Vec<String> = record
        .all_consumers()
        .difference(&record.consumers())
        .map(|t| t.to_string())
        .collect();
    if !no_output.is_empty() {
        writeln!(out, "  consumed without output: [{}]", no_output.join(", "))?;
    }
    Ok(())
}

fn run_command(cli: &Cli, out: &mut impl Write) -> Result<()> {
    let config = DatastoreConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    let _span = datastore_span(&config.datastore_root, cli.command.name()).entered();

    match &cli.command {
        Commands::Validate => cmd_validate(&config, cli.json, out),
        Commands::Translate {
            category,
            name,
            reverse,
        } => cmd_translate(&config, category, name, *reverse, out),
        Commands::Scan { dir, datastore } => cmd_scan(&config, dir, *datastore, cli.json, out),
        Commands::Lineage { files } => cmd_lineage(&config, files, cli.json, out),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "strata",
        level: if cli.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        },
        log_dir: Some(strata_home().join("logs")),
    }) {
        eprintln!("Warning: failed to initialize logging: {:?}", err);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match run_command(&cli, &mut out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

//! Ledger Sync CLI

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ledger_sync::config::{LogFormat, LoggingConfig, parse_tables_json};
use ledger_sync::error::TracingReporter;
use ledger_sync::{
    Error, ErrorReporter, MetadataStore, MotherDuckClient, SyncClient, SyncConfig, SyncMode, SyncProgress,
    Warehouse,
};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "ledger-sync")]
#[command(author, version, about = "Sync accounting tables from SQL Server to MotherDuck")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Full refresh (replace every table)
    #[arg(long, global = true, conflicts_with = "incremental")]
    full: bool,

    /// Incremental upsert (merge into existing tables)
    #[arg(long, global = true)]
    incremental: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (overrides the config file)
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync (default)
    Sync,
    /// Test connectivity
    Test,
    /// Show recorded sync metadata
    Status,
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "ledger-sync.toml")]
        output: String,
    },
    /// Generate base64 secret from tables.local.json
    GenerateSecret {
        /// Input JSON file path
        #[arg(short, long, default_value = "tables.local.json")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            let interrupted = matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled));
            error!("Error: {}", e);
            if interrupted {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                eprintln!("{} {}", style("✗").red(), e);
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Handle init command first - it doesn't need config
    if let Some(Commands::Init { ref output }) = cli.command {
        init_logging(&LoggingConfig::default(), &cli);
        return run_init(output);
    }

    // Handle generate-secret command - doesn't need config
    if let Some(Commands::GenerateSecret { ref input }) = cli.command {
        init_logging(&LoggingConfig::default(), &cli);
        return run_generate_secret(input);
    }

    let (config, origin) = load_config(cli.config.as_deref())?;
    init_logging(&config.logging, &cli);
    info!(
        "Loaded config from {} ({} tables enabled)",
        origin,
        config.enabled_tables().count()
    );
    let mode = if cli.full {
        SyncMode::Full
    } else if cli.incremental {
        SyncMode::Incremental
    } else {
        config.sync.mode
    };

    match cli.command {
        None | Some(Commands::Sync) => run_sync(config, mode, cli.json, cli.quiet).await,
        Some(Commands::Test) => run_test(config, cli.json).await,
        Some(Commands::Status) => run_status(config, cli.json),
        Some(Commands::Init { .. }) => unreachable!(), // Handled above
        Some(Commands::GenerateSecret { .. }) => unreachable!(), // Handled above
    }
}

fn load_config(path: Option<&str>) -> Result<(SyncConfig, String), Box<dyn std::error::Error>> {
    if let Some(p) = path {
        return Ok((SyncConfig::from_file(p)?, p.to_string()));
    }

    for default in &["ledger-sync.toml", ".ledger-sync.toml"] {
        if std::path::Path::new(default).exists() {
            return Ok((SyncConfig::from_file(default)?, default.to_string()));
        }
    }

    Ok((SyncConfig::from_env()?, "environment".to_string()))
}

async fn run_sync(
    config: SyncConfig,
    mode: SyncMode,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !quiet && !json {
        println!("{} v{}", style("Ledger Sync").bold(), ledger_sync::VERSION);
        println!("Mode: {}\n", style(mode).cyan());
    }

    let client = tokio::select! {
        client = SyncClient::connect(config) => client.inspect_err(|e| TracingReporter.capture(e))?,
        _ = tokio::signal::ctrl_c() => return Err(Error::Cancelled.into()),
    };

    let bar = if quiet || json {
        ProgressBar::hidden()
    } else {
        progress_bar()
    };
    let progress = bar.clone();
    let mut client = client.with_progress(move |p: SyncProgress| {
        progress.set_position(u64::from(p.percent));
        progress.set_message(format!("{} ({})", p.table, p.phase));
    });

    let outcome = tokio::select! {
        result = client.sync(mode) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, closing connections");
            Err(Error::Cancelled)
        }
    };
    bar.finish_and_clear();
    let snapshot = client.metrics().snapshot();
    client.close().await;
    let result = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !quiet {
        println!("{} Sync completed successfully", style("✓").green());
        println!(
            "\nDuration: {}",
            humantime::format_duration(Duration::from_millis(result.duration_ms))
        );
        println!("Total records: {}", result.total_records());
        println!("Throughput: {:.0} rows/s\n", snapshot.rows_per_second());

        for tr in &result.tables {
            println!(
                "  {} {}: {} rows in {} batches [{}] ({})",
                style("✓").green(),
                tr.table,
                tr.rows_loaded,
                tr.batches,
                tr.strategy,
                humantime::format_duration(Duration::from_millis(tr.duration_ms))
            );
            if tr.nullified_cells > 0 {
                println!(
                    "      {} {} invalid cells set to NULL",
                    style("!").yellow(),
                    tr.nullified_cells
                );
            }
            if !tr.metadata_recorded && tr.rows_loaded > 0 {
                println!("      {} metadata not recorded", style("!").yellow());
            }
        }
    }

    Ok(())
}

async fn run_test(config: SyncConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !json {
        println!("Testing connectivity...\n");
    }

    let mut client = SyncClient::connect(config)
        .await
        .inspect_err(|e| TracingReporter.capture(e))?;
    let outcome = client.test_connectivity().await;
    client.close().await;
    let report = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("  SQL Server:    {}", report.server_version);
        println!("  Linked server: {}", report.linked_server);
        println!("\n{} All connectivity tests passed!", style("✓").green());
    }
    Ok(())
}

fn run_status(config: SyncConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let table = ledger_sync::TableId::new(
        &config.warehouse.database,
        &config.warehouse.dataset,
        &config.sync.metadata_table,
    );
    let warehouse = MotherDuckClient::connect(config.warehouse)?;
    let records = MetadataStore::new(&warehouse, table).read_all();
    if let Err(e) = warehouse.close() {
        warn!("Failed to close warehouse connection: {}", e);
    }
    let records = records?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("Sync Metadata\n");
    if records.is_empty() {
        println!("  No tables synced yet");
        return Ok(());
    }
    for record in &records {
        let last_sync = record
            .last_sync_timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".into());
        let max_date = record
            .last_max_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<24} {:>10} rows  {:<12} last sync {}  max date {}",
            style(&record.table_name).bold(),
            record.records_synced,
            record.sync_mode,
            last_sync,
            max_date
        );
    }
    println!("\nTotal: {} tables", records.len());
    Ok(())
}

fn run_generate_secret(input: &str) -> Result<(), Box<dyn std::error::Error>> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let content =
        std::fs::read_to_string(input).map_err(|e| format!("Failed to read {}: {}", input, e))?;

    // Reject files the sync could not read back
    let tables = parse_tables_json(&content)?;

    let parsed: serde_json::Value = serde_json::from_str(&content)?;
    let minified = serde_json::to_string(&parsed)?;
    let encoded = STANDARD.encode(minified.as_bytes());

    println!("=== SYNC_TABLES_CONFIG Secret ({} tables) ===\n", tables.len());
    println!("{}\n", encoded);
    println!("=== Instructions ===");
    println!("1. Go to GitHub repo → Settings → Secrets → Actions");
    println!("2. Create/update secret: SYNC_TABLES_CONFIG");
    println!("3. Paste the value above");

    Ok(())
}

fn run_init(output: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = format!(
        "# Ledger Sync Configuration\n\n{}",
        SyncConfig::sample().to_toml()?
    );

    std::fs::write(output, config)?;
    println!("{} Created: {}", style("✓").green(), output);
    println!("\nEdit the file or use environment variables:");
    println!("  MSSQL_URL, MOTHERDUCK_TOKEN, SYNC_TABLES_CONFIG");
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn init_logging(settings: &LoggingConfig, cli: &Cli) {
    if cli.quiet {
        return;
    }
    let level = cli.log_level.as_deref().unwrap_or(&settings.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs always go to stderr so `--json` output on stdout stays parseable
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match (cli.json || settings.format == LogFormat::Json, settings.timestamps) {
        (true, true) => builder.json().init(),
        (true, false) => builder.json().without_time().init(),
        (false, true) => builder.init(),
        (false, false) => builder.without_time().init(),
    }
}

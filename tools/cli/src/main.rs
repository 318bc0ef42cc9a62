//! imgbackup CLI - Back up and upload images across hosting providers.
//!
//! This tool provides a command-line interface for backing up images from
//! configured providers, uploading local images and inspecting the
//! operation history.

mod progress;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use imgbackup_common::{AppConfig, Operation, ProviderConfig, RecordStatus};
use imgbackup_metadata::RecordFilter;
use imgbackup_storage::builtin_providers;
use imgbackup_transfer::{
    collect_images, BackupOptions, BackupService, BackupSummary, LogProgress, ProgressSink,
};

use progress::BarProgress;

#[derive(Parser)]
#[command(name = "imgbackup")]
#[command(about = "imgbackup - Image hosting backup and upload")]
#[command(version)]
struct Cli {
    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration with a template for every provider.
    Init {
        /// Overwrite an existing configuration.
        #[arg(short, long)]
        force: bool,
    },

    /// List supported providers and their configuration state.
    List,

    /// Test the connection to a provider.
    Test {
        /// Provider name.
        provider: String,
    },

    /// Show provider information.
    Info {
        /// Provider name.
        provider: String,
    },

    /// Back up all images of a provider.
    Backup {
        /// Provider name.
        provider: String,

        /// Output directory (default: from configuration).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of images.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Download files that already exist locally.
        #[arg(long)]
        no_skip_existing: bool,
    },

    /// Back up every enabled provider.
    BackupAll {
        /// Output directory (default: from configuration).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of images per provider.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Download files that already exist locally.
        #[arg(long)]
        no_skip_existing: bool,
    },

    /// Upload one file.
    Upload {
        /// Provider name.
        provider: String,

        /// File to upload.
        file: PathBuf,

        /// Remote path.
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Upload the images of a directory.
    UploadAll {
        /// Provider name.
        provider: String,

        /// Directory to scan (not recursive).
        dir: PathBuf,

        /// Only files whose name contains this text.
        #[arg(short, long)]
        pattern: Option<String>,

        /// Remote path prefix.
        #[arg(short, long)]
        remote_prefix: Option<String>,

        /// Maximum number of files.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show operation statistics.
    Stats {
        /// Include the breakdown by operation.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the operation history.
    History {
        /// Only this provider.
        #[arg(short, long)]
        provider: Option<String>,

        /// Only this operation: download or upload.
        #[arg(short, long)]
        operation: Option<String>,

        /// Only this status: success, failed or skipped.
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of records.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// List local files with identical content.
    Duplicates,

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        // `init --force` replaces a broken file.
        Err(_) if matches!(cli.command, Commands::Init { force: true }) => AppConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to load configuration from {}", config_path.display())
            })
        }
    };

    // Setup logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    if !config_path.exists() && !matches!(cli.command, Commands::Init { .. }) {
        warn!(
            "No configuration at {}, using defaults. Run `imgbackup init` to create one.",
            config_path.display()
        );
    }

    let success = match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force)?,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "imgbackup", &mut std::io::stdout());
            true
        }
        command => {
            let service = BackupService::open(config).context("Failed to open backup service")?;
            let progress: Box<dyn ProgressSink> = if cli.verbose {
                Box::new(LogProgress::new())
            } else {
                Box::new(BarProgress::new())
            };
            run(&service, command, progress.as_ref()).await?
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(
    service: &BackupService,
    command: Commands,
    progress: &dyn ProgressSink,
) -> Result<bool> {
    match command {
        Commands::List => cmd_list(service),
        Commands::Test { provider } => Ok(cmd_test(service, &provider).await),
        Commands::Info { provider } => cmd_info(service, &provider).await,
        Commands::Backup {
            provider,
            output,
            limit,
            no_skip_existing,
        } => {
            let options = BackupOptions {
                limit,
                skip_existing: !no_skip_existing,
            };
            cmd_backup(service, &provider, output.as_deref(), &options, progress).await
        }
        Commands::BackupAll {
            output,
            limit,
            no_skip_existing,
        } => {
            let options = BackupOptions {
                limit,
                skip_existing: !no_skip_existing,
            };
            Ok(cmd_backup_all(service, output.as_deref(), &options, progress).await)
        }
        Commands::Upload {
            provider,
            file,
            remote,
        } => Ok(cmd_upload(service, &provider, &file, remote.as_deref()).await),
        Commands::UploadAll {
            provider,
            dir,
            pattern,
            remote_prefix,
            limit,
        } => {
            cmd_upload_all(
                service,
                &provider,
                &dir,
                pattern.as_deref(),
                remote_prefix.as_deref(),
                limit,
                progress,
            )
            .await
        }
        Commands::Stats { detailed } => cmd_stats(service, detailed),
        Commands::History {
            provider,
            operation,
            status,
            limit,
        } => cmd_history(service, provider, operation, status, limit),
        Commands::Duplicates => cmd_duplicates(service),
        Commands::Init { .. } | Commands::Completions { .. } => Ok(true),
    }
}

/// Write the default configuration.
fn cmd_init(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = AppConfig::default();
    for (name, kind, _) in builtin_providers() {
        config.insert_provider(ProviderConfig::template(name, kind));
    }
    config.save(path).context("Failed to write configuration")?;

    println!("Configuration written to {}", path.display());
    println!("Edit the provider entries and set `enabled: true` to use them.");
    Ok(true)
}

/// List supported providers.
fn cmd_list(service: &BackupService) -> Result<bool> {
    println!("Providers:");
    for name in service.list_providers() {
        let state = match service.config().provider(&name) {
            None => "not configured",
            Some(p) if !p.enabled => "disabled",
            Some(p) if p.validate().is_err() => "invalid configuration",
            Some(_) => "enabled",
        };
        println!("  {:<12} {}", name, state);
    }
    Ok(true)
}

/// Test a provider connection.
async fn cmd_test(service: &BackupService, provider: &str) -> bool {
    info!("Testing connection to {}", provider);
    let connected = service.test_provider(provider).await;
    if connected {
        println!("{}: connection OK", provider);
    } else {
        println!("{}: connection FAILED", provider);
    }
    connected
}

/// Show provider information.
async fn cmd_info(service: &BackupService, provider: &str) -> Result<bool> {
    let info = service
        .provider_info(provider)
        .await
        .context("Failed to get provider information")?;

    println!("Provider Information:");
    println!("  Name: {}", info.name);
    println!("  Enabled: {}", info.enabled);
    println!("  Configuration valid: {}", info.config_valid);
    println!("  Connected: {}", info.connected);
    match info.image_count {
        Some(count) => println!("  Images: {}", count),
        None => println!("  Images: unknown"),
    }
    Ok(info.connected)
}

fn print_summary(summary: &BackupSummary) {
    println!("Backup summary for {}:", summary.provider);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Failed:    {}", summary.failed);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Total:     {}", summary.processed());
}

/// Back up one provider.
async fn cmd_backup(
    service: &BackupService,
    provider: &str,
    output: Option<&Path>,
    options: &BackupOptions,
    progress: &dyn ProgressSink,
) -> Result<bool> {
    let summary = service
        .run_backup(provider, output, options, progress)
        .await
        .with_context(|| format!("Cannot back up {}", provider))?;

    print_summary(&summary);
    Ok(summary.is_success())
}

/// Back up every enabled provider.
async fn cmd_backup_all(
    service: &BackupService,
    output: Option<&Path>,
    options: &BackupOptions,
    progress: &dyn ProgressSink,
) -> bool {
    let report = service
        .backup_all(output, options, progress)
        .await;

    if report.results.is_empty() {
        println!("No enabled providers. Run `imgbackup list` to see their state.");
        return false;
    }
    for summary in report.summaries.values() {
        print_summary(summary);
    }
    println!("Results:");
    for (name, ok) in &report.results {
        println!("  {:<12} {}", name, if *ok { "OK" } else { "FAILED" });
    }
    report.is_success()
}

/// Upload a single file.
async fn cmd_upload(service: &BackupService, provider: &str, file: &Path, remote: Option<&str>) -> bool {
    let result = service.upload(provider, file, remote).await;
    if result.success {
        println!("Uploaded {}", file.display());
        if let Some(url) = &result.url {
            println!("  URL: {}", url);
        }
    } else {
        println!("Upload of {} failed: {}", file.display(), result.message);
    }
    result.success
}

/// Upload the images of a directory.
async fn cmd_upload_all(
    service: &BackupService,
    provider: &str,
    dir: &Path,
    pattern: Option<&str>,
    remote_prefix: Option<&str>,
    limit: Option<usize>,
    progress: &dyn ProgressSink,
) -> Result<bool> {
    let files = collect_images(dir, pattern, limit)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    if files.is_empty() {
        println!("No images found in {}", dir.display());
        return Ok(true);
    }

    info!("Uploading {} files to {}", files.len(), provider);
    let summary = service
        .run_upload_batch(provider, &files, remote_prefix, progress)
        .await
        .with_context(|| format!("Cannot upload to {}", provider))?;

    for (path, result) in &summary.results {
        match (&result.url, result.success) {
            (Some(url), true) => println!("  {} -> {}", path.display(), url),
            (None, true) => println!("  {} uploaded", path.display()),
            (_, false) => println!("  {} FAILED: {}", path.display(), result.message),
        }
    }
    println!(
        "Upload summary: {} succeeded, {} failed",
        summary.succeeded, summary.failed
    );
    Ok(summary.is_success())
}

/// Show statistics.
fn cmd_stats(service: &BackupService, detailed: bool) -> Result<bool> {
    let stats = service.statistics().context("Failed to read statistics")?;

    println!("Statistics:");
    println!("  Operations: {}", stats.total_operations);
    println!("  Successful: {}", stats.successful);
    println!("  Failed:     {}", stats.failed);
    println!("  Skipped:    {}", stats.skipped);
    println!("  Files:      {}", stats.total_files);
    println!("  Total size: {} bytes", stats.total_size);

    if detailed {
        println!("  By operation:");
        for (operation, count) in &stats.operations_by_type {
            println!("    {:<10} {}", operation, count);
        }
    }
    Ok(true)
}

/// Show history.
fn cmd_history(
    service: &BackupService,
    provider: Option<String>,
    operation: Option<String>,
    status: Option<String>,
    limit: usize,
) -> Result<bool> {
    let filter = RecordFilter {
        operation: operation
            .map(|o| o.parse::<Operation>())
            .transpose()
            .context("Invalid operation")?,
        provider,
        status: status
            .map(|s| s.parse::<RecordStatus>())
            .transpose()
            .context("Invalid status")?,
        limit: Some(limit),
    };

    let records = service.history(&filter).context("Failed to read history")?;
    if records.is_empty() {
        println!("No records.");
        return Ok(true);
    }

    for record in records {
        println!(
            "{}  {:<8} {:<7} {:<10} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.operation.as_str(),
            record.status.as_str(),
            record.provider,
            record.file_path
        );
        if !record.message.is_empty() && record.status != RecordStatus::Success {
            println!("    {}", record.message);
        }
    }
    Ok(true)
}

/// List duplicate files.
fn cmd_duplicates(service: &BackupService) -> Result<bool> {
    let duplicates = service
        .find_duplicates()
        .context("Failed to search for duplicates")?;

    if duplicates.is_empty() {
        println!("No duplicates found.");
        return Ok(true);
    }

    println!("Found {} groups of identical files:", duplicates.len());
    for (hash, paths) in &duplicates {
        println!("  {}", &hash[..hash.len().min(16)]);
        for path in paths {
            println!("    {}", path);
        }
    }
    Ok(true)
}

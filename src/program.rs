use std::env::consts::{ARCH, FAMILY, OS};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Error};
use console::{Term, style};
use tracing::{info, trace, warn};

use crate::scraper::cli::RunArgs;
use crate::scraper::query_resolver::read_url_list;
use crate::scraper::{
    AppConfig, Cli, Commands, ConfigManager, DownloadEngineConfig, HttpSource, Logger, Pipeline,
    PipelineOptions, RunReport, SearchPageResolver, init_logger, resolve_all, scan_directory,
    sweep_corrupt, tui,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout for fetching a search results page.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// A program class that handles the flow of one command from parsed arguments to exit.
pub(crate) struct Program {
    cli: Cli,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Runs the selected command.
    pub(crate) async fn run(self) -> Result<(), Error> {
        let config_dir = match &self.cli.config {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to get working directory")?,
        };
        let manager = ConfigManager::new(&config_dir);
        let mut config = manager.load().context("Failed to load configuration")?;

        match self.cli.command {
            Some(Commands::InitConfig) => {
                let _logger = start_logging(&config)?;
                if manager.create_default_config()? {
                    println!("Wrote {}", manager.config_path().display());
                } else {
                    println!("{} already exists", manager.config_path().display());
                }
                Ok(())
            }
            Some(Commands::Resolve(args)) => {
                args.apply(&mut config)?;
                config.validate()?;
                let _logger = start_logging(&config)?;
                resolve(&config).await
            }
            Some(Commands::Sweep { dir }) => {
                config.validate()?;
                let _logger = start_logging(&config)?;
                let dir = match dir {
                    Some(dir) => dir,
                    None => config.output_directory()?,
                };
                sweep(&dir)
            }
            Some(Commands::Run(args)) => run_pipeline(config, &args).await,
            None => run_pipeline(config, &self.cli.run).await,
        }
    }
}

fn start_logging(config: &AppConfig) -> Result<Logger, Error> {
    let logger = init_logger(config).context("Failed to initialize logging")?;
    trace!("Program Name: {}", NAME);
    trace!("Program Version: {}", VERSION);
    log_system_information();
    Ok(logger)
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}

async fn run_pipeline(mut config: AppConfig, args: &RunArgs) -> Result<(), Error> {
    args.apply(&mut config).context("Invalid configuration")?;
    let _logger = start_logging(&config)?;

    Term::stderr().set_title(NAME);

    let output_directory = config.output_directory()?;
    let options = PipelineOptions {
        output_directory: output_directory.clone(),
        fetch: DownloadEngineConfig::from_app_config(&config),
        dedup: config.cleaning.dedup_strategy,
        validation: config.cleaning.validation,
    };
    info!(
        "Storing images in {} (concurrency {}, timeout {}s, validation {:?})",
        output_directory.display(),
        options.fetch.max_concurrent_downloads,
        config.fetch.timeout_secs,
        options.validation
    );

    let source = HttpSource::new(&config.fetch.user_agent, config.fetch_timeout())?;
    let seed_list = match &args.urls_file {
        Some(path) => Some(
            read_url_list(path).with_context(|| format!("Failed to read URL list {}", path.display()))?,
        ),
        None => None,
    };
    let resolver = SearchPageResolver::new(&config.fetch.user_agent, RESOLVE_TIMEOUT)?;

    let progress = tui::download_progress(Term::stderr().is_term());
    let pipeline = Pipeline::new(options, source).with_progress(progress.clone());
    let result = match seed_list {
        Some(locators) => pipeline.run_locators(&locators).await,
        None => pipeline.run(&resolver, &config.queries).await,
    };
    tui::finish_progress(&progress);
    let report = result.context("Image run aborted")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn resolve(config: &AppConfig) -> Result<(), Error> {
    let resolver = SearchPageResolver::new(&config.fetch.user_agent, RESOLVE_TIMEOUT)?;
    let locators = resolve_all(&resolver, &config.queries).await;
    for locator in &locators {
        println!("{}", locator);
    }
    if locators.is_empty() {
        warn!("No image URLs found for {} queries", config.queries.len());
    }
    Ok(())
}

fn sweep(dir: &Path) -> Result<(), Error> {
    let files = scan_directory(dir).with_context(|| format!("Failed to scan {}", dir.display()))?;
    let report = sweep_corrupt(&files);
    println!(
        "{} images checked, {} removed, {} kept",
        files.len(),
        style(report.removed.len()).red(),
        style(report.kept.len()).green()
    );
    if !report.undeletable.is_empty() {
        warn!("{} corrupt images could not be removed", report.undeletable.len());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", style("Run summary").bold());
    println!("  Image URLs:         {}", report.locators);
    println!(
        "  Downloaded:         {} ({} failed)",
        style(report.fetched).green(),
        style(report.fetch_failed).red()
    );
    for failure in &report.failed {
        println!(
            "    {} {} ({})",
            style("x").red(),
            failure.locator,
            style(&failure.error).dim()
        );
    }
    println!("  After empty filter: {}", report.after_presence_filter);
    println!("  After de-dup:       {}", report.after_dedup);
    if let Some(valid) = report.after_in_memory_validation {
        println!("  After validation:   {}", valid);
    }
    if let Some(removed) = report.removed_by_sweep {
        println!("  Corrupt removed:    {}", style(removed).red());
    }
    println!(
        "  Stored:             {} in {}",
        style(report.stored_count()).green().bold(),
        report.output_directory.display()
    );
}

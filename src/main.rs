//! Podlease CLI entrypoint.
//!
//! This is the main entrypoint for the podlease command-line tool.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use podlease::capacity::CapacityBackend;
use podlease::cleanup::spawn_signal_listener;
use podlease::cli::{Cli, Commands, OutputFormat, OutputFormatter};
use podlease::config::{
    ConfigOverrides, ConfigParser, ConfigValidator, EnvTemplate, Settings,
};
use podlease::error::{ConfigError, PodleaseError, Stage, StageError};
use podlease::orchestrator::{self, DeployPlan, Orchestrator};
use podlease::runpod::RunPodClient;
use podlease::tunnel::{SshAuth, SystemLauncher};

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode, StageError> {
    let formatter = OutputFormatter::new(cli.output);
    let parser = cli
        .env_file
        .as_ref()
        .map_or_else(ConfigParser::new, |path| ConfigParser::new().with_env_file(path));

    match cli.command {
        Commands::Init {
            api_key,
            force,
            verify,
            ssh_password,
            min_vram,
            max_cost,
            image,
            disk,
        } => {
            let mut template = EnvTemplate::new(api_key);
            template.ssh_password = ssh_password;
            if let Some(vram) = min_vram {
                template.min_vram_gb = vram;
            }
            if let Some(cost) = max_cost {
                template.max_cost_per_hour = cost;
            }
            if let Some(image) = image {
                template.docker_image = image;
            }
            if let Some(disk) = disk {
                template.container_disk_gb = disk;
            }
            cmd_init(parser.env_file(), &template, force, verify)
                .await
                .map_err(|e| e.at(Stage::Configuration))
        }
        Commands::Offerings { spot } => {
            let settings = load_settings(&parser, &ConfigOverrides::default())?;
            cmd_offerings(&settings, spot, &formatter).await
        }
        Commands::Deploy { spot, overrides } => {
            let settings = load_settings(&parser, &overrides.into())?;
            cmd_deploy(&settings, spot, &formatter).await
        }
        Commands::Stop => {
            let settings = load_settings(&parser, &ConfigOverrides::default())?;
            cmd_stop(&settings, &formatter).await
        }
    }
}

/// Writes a `.env` file.
async fn cmd_init(
    path: &Path,
    template: &EnvTemplate,
    force: bool,
    verify: bool,
) -> podlease::error::Result<ExitCode> {
    if verify {
        let defaults = Settings::with_api_key(template.api_key.clone());
        let client = RunPodClient::new(&template.api_key, defaults.retry)?;
        if !client.validate_api_key().await? {
            return Err(PodleaseError::Config(ConfigError::validation(
                "RunPod rejected the API key",
                "RUNPOD_API_KEY",
            )));
        }
        info!("API key accepted");
    }

    let mut settings = Settings::with_api_key(template.api_key.clone());
    if let Some(password) = &template.ssh_password {
        settings.ssh_password.clone_from(password);
    }
    settings.min_vram_gb = template.min_vram_gb;
    settings.max_cost_per_hour = template.max_cost_per_hour;
    settings.docker_image.clone_from(&template.docker_image);
    settings.container_disk_gb = template.container_disk_gb;
    for warning in ConfigValidator::new().validate(&settings)?.warnings {
        warn!("{warning}");
    }

    template.write(path, force)?;

    eprintln!("\nNext steps:");
    eprintln!("  1. Review {}", path.display());
    eprintln!("  2. Run 'podlease offerings' to see what your limits can buy");
    eprintln!("  3. Run 'podlease deploy' to lease a pod");

    Ok(ExitCode::SUCCESS)
}

/// Lists qualifying offerings.
async fn cmd_offerings(
    settings: &Settings,
    spot: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode, StageError> {
    let client = create_runpod_client(settings).map_err(|e| e.at(Stage::Selection))?;
    let constraint = settings.constraint(spot);

    let candidates = orchestrator::find_candidates(client.as_ref(), &constraint).await?;

    emit(formatter, &formatter.format_offerings(constraint.market, &candidates));
    Ok(ExitCode::SUCCESS)
}

/// Leases a pod and holds it until interrupted.
async fn cmd_deploy(
    settings: &Settings,
    spot: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode, StageError> {
    let client = create_runpod_client(settings).map_err(|e| e.at(Stage::Configuration))?;
    let auth = SshAuth::resolve(settings.ssh_key_path.as_deref(), Some(&settings.ssh_password))
        .map_err(|e| PodleaseError::from(e).at(Stage::Configuration))?;
    info!("SSH authentication: {}", auth.describe());

    let run_id = orchestrator::run_id();
    debug!("Run id: {run_id}");
    let plan = DeployPlan::from_settings(settings, spot).with_run_env(&run_id, &auth);

    let orchestrator = Orchestrator::new(
        client,
        Arc::new(SystemLauncher),
        auth,
        settings.poll,
        settings.tunnel,
    );
    let coordinator = orchestrator.coordinator();
    let listener = spawn_signal_listener(Arc::clone(&coordinator));

    let outcome = orchestrator
        .deploy(&plan, |report| {
            emit(formatter, &formatter.format_ready(report));
        })
        .await;
    listener.abort();

    eprintln!("{}", formatter.format_outcome(&outcome));

    let code = if outcome.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };

    if coordinator.forced_exit() {
        warn!("Cleanup finished; exiting immediately");
        std::process::exit(if outcome.success() { 0 } else { 1 });
    }

    Ok(code)
}

/// Terminates every pod this tool created.
async fn cmd_stop(settings: &Settings, formatter: &OutputFormatter) -> Result<ExitCode, StageError> {
    let client = create_runpod_client(settings).map_err(|e| e.at(Stage::Cleanup))?;
    let results = orchestrator::stop_matching(client, &settings.pod_name_prefix).await?;

    emit(formatter, &formatter.format_stop(&results));

    let failed = results.iter().filter(|(_, outcome)| outcome.is_err()).count();
    if failed > 0 {
        error!("{failed} pod(s) could not be terminated; you may still be billed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Loads and validates settings.
fn load_settings(parser: &ConfigParser, overrides: &ConfigOverrides) -> Result<Settings, StageError> {
    let settings = parser
        .load(overrides)
        .map_err(|e| e.at(Stage::Configuration))?;
    debug!("Loaded settings from {}: {settings:?}", parser.env_file().display());
    Ok(settings)
}

/// Creates a `RunPod` client from settings.
fn create_runpod_client(settings: &Settings) -> podlease::error::Result<Arc<dyn CapacityBackend>> {
    let client = RunPodClient::with_endpoints(
        &settings.api_key,
        &settings.rest_url,
        &settings.graphql_url,
        settings.retry,
    )?;
    Ok(Arc::new(client))
}

/// Writes a command result: JSON to stdout, text to stderr.
#[allow(clippy::print_stdout)]
fn emit(formatter: &OutputFormatter, rendered: &str) {
    match formatter.format() {
        OutputFormat::Json => println!("{rendered}"),
        OutputFormat::Text => eprintln!("{rendered}"),
    }
}

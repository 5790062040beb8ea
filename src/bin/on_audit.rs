use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use openneuro_audit::app::{App, AuditOptions, FetchOptions, LogProgress, RunOptions};
use openneuro_audit::catalog::GraphqlCatalogClient;
use openneuro_audit::config::{ApiKey, ConfigLoader, ResolvedConfig};
use openneuro_audit::domain::DatasetId;
use openneuro_audit::error::AuditError;
use openneuro_audit::fetch::SystemFetcher;
use openneuro_audit::output::JsonOutput;
use openneuro_audit::store::Store;

#[derive(Parser)]
#[command(name = "on-audit")]
#[command(about = "Harvest OpenNeuro dataset metadata and audit BIDS layouts")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List every dataset id in the catalog")]
    Ids,
    #[command(about = "Show snapshots and the latest snapshot description")]
    Info(InfoArgs),
    #[command(about = "Clone datasets or download their metadata files")]
    Fetch(FetchArgs),
    #[command(about = "Clone and audit a single dataset")]
    Audit(AuditArgs),
    #[command(about = "Audit every local dataset in batches")]
    Run(RunArgs),
    #[command(about = "Write the list of catalog datasets not yet audited")]
    Runlist(OutFolderArgs),
    #[command(about = "Aggregate accumulated output tables")]
    Report(OutFolderArgs),
}

#[derive(Args)]
struct InfoArgs {
    id: DatasetId,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(required = true)]
    ids: Vec<DatasetId>,

    #[arg(long)]
    dir_path: PathBuf,

    #[arg(long)]
    select: bool,
}

#[derive(Args)]
struct AuditArgs {
    #[arg(long)]
    openneuro_id: DatasetId,

    #[arg(long)]
    dir_path: PathBuf,

    #[arg(long)]
    out_folder: PathBuf,

    #[arg(long)]
    no_clone: bool,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    dir_path: PathBuf,

    #[arg(long)]
    out_folder: PathBuf,

    #[arg(long)]
    n_cpus: usize,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    resume_after: Option<DatasetId>,

    #[arg(long, default_value = "final")]
    prefix: String,

    #[arg(long)]
    fetch_missing: bool,
}

#[derive(Args)]
struct OutFolderArgs {
    #[arg(long)]
    out_folder: PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AuditError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AuditError) -> u8 {
    match error {
        AuditError::InvalidDatasetId(_)
        | AuditError::InvalidSnapshot(_)
        | AuditError::MissingConfig(_)
        | AuditError::ConfigRead(_)
        | AuditError::ConfigParse(_)
        | AuditError::MissingCredentials(_)
        | AuditError::InvalidInput(_)
        | AuditError::ResumeMarkerNotFound(_) => 2,
        AuditError::CatalogHttp(_)
        | AuditError::CatalogStatus { .. }
        | AuditError::CatalogResponse(_)
        | AuditError::Fetch(_)
        | AuditError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let sink = LogProgress;

    match cli.command {
        Commands::Ids => {
            let app = build_app(&config, Store::from_std(&cwd()?, &cwd()?)?, true)?;
            let result = app.ids(&sink)?;
            JsonOutput::print_ids(&result).into_diagnostic()?;
        }
        Commands::Info(args) => {
            let app = build_app(&config, Store::from_std(&cwd()?, &cwd()?)?, true)?;
            let result = app.info(&args.id, &sink)?;
            JsonOutput::print_info(&result).into_diagnostic()?;
        }
        Commands::Fetch(args) => {
            let store = Store::from_std(&args.dir_path, &args.dir_path)?;
            let app = build_app(&config, store, args.select)?;
            let result = app.fetch(&args.ids, FetchOptions { select: args.select }, &sink)?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
            if result.items.iter().any(|item| item.error.is_some()) {
                return Err(AuditError::Fetch("one or more datasets failed to fetch".to_string()).into());
            }
        }
        Commands::Audit(args) => {
            let store = Store::from_std(&args.dir_path, &args.out_folder)?;
            let app = build_app(&config, store, false)?;
            let options = AuditOptions {
                no_clone: args.no_clone,
            };
            let result = app.audit(&args.openneuro_id, options, &sink)?;
            JsonOutput::print_audit(&result).into_diagnostic()?;
        }
        Commands::Run(args) => {
            let store = Store::from_std(&args.dir_path, &args.out_folder)?;
            let app = build_app(&config, store, args.fetch_missing)?;
            let options = RunOptions {
                n_cpus: args.n_cpus,
                batch_size: args.batch_size,
                resume_after: args.resume_after,
                prefix: args.prefix,
                fetch_missing: args.fetch_missing,
            };
            let report = app.run(options, &sink)?;
            JsonOutput::print_run(&report).into_diagnostic()?;
        }
        Commands::Runlist(args) => {
            let app = build_app(&config, Store::from_std(&cwd()?, &args.out_folder)?, true)?;
            let result = app.runlist(&sink)?;
            JsonOutput::print_runlist(&result).into_diagnostic()?;
        }
        Commands::Report(args) => {
            let app = build_app(&config, Store::from_std(&cwd()?, &args.out_folder)?, false)?;
            let result = app.report(&sink)?;
            JsonOutput::print_report(&result).into_diagnostic()?;
        }
    }
    Ok(())
}

fn build_app(
    config: &ResolvedConfig,
    store: Store,
    needs_api: bool,
) -> Result<App<GraphqlCatalogClient, SystemFetcher>, AuditError> {
    let api_key = if needs_api {
        Some(ApiKey::resolve(config)?)
    } else {
        ApiKey::resolve(config).ok()
    };
    let catalog = GraphqlCatalogClient::new(&config.endpoint, api_key.as_ref())?;
    let fetcher = SystemFetcher::new(&config.clone_base_url, config.private_sibling.clone());
    Ok(App::new(store, catalog, fetcher, config.clone()))
}

fn cwd() -> Result<PathBuf, AuditError> {
    std::env::current_dir().map_err(|err| AuditError::Filesystem(err.to_string()))
}

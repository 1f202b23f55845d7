use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use storesync_sync::{inspect_snapshots, source_from_config, SyncConfig, SyncPipeline, SyncPlan};
use storesync_web::WebConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "storesync")]
#[command(about = "Storefront content sync and snapshot write-back service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull settings and catalog from the remote source into local snapshots.
    Sync(SyncArgs),
    /// Run the local snapshot write service.
    Serve(ServeArgs),
    /// Summarize the snapshot files currently on disk.
    Report(ReportArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Step {
    Settings,
    Catalog,
}

#[derive(Debug, Default, Args)]
struct PathArgs {
    /// Directory holding store-settings.json and products.json.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Root of the mirrored assets tree.
    #[arg(long)]
    assets_dir: Option<PathBuf>,
}

impl PathArgs {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(dir) = self.assets_dir {
            config.assets_dir = dir;
        }
    }
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Run a single step instead of settings then catalog.
    #[arg(long, value_enum)]
    only: Option<Step>,
    /// Run the catalog step even if the settings step failed.
    #[arg(long)]
    keep_going: bool,
    /// Read records from a local fixture directory instead of the remote API.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    paths: PathArgs,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    paths: PathArgs,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "storesync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(args).await,
        Commands::Serve(args) => {
            let mut config = WebConfig::from_env();
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            if let Some(dir) = args.data_dir {
                config.data_dir = dir;
            }
            storesync_web::serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report(args) => {
            let mut config = SyncConfig::from_env();
            args.paths.apply(&mut config);
            let report = inspect_snapshots(&config).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.render_markdown());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sync(args: SyncArgs) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env();
    args.paths.apply(&mut config);
    debug!(?config, "sync configuration");

    let plan = SyncPlan {
        settings: !matches!(args.only, Some(Step::Catalog)),
        catalog: !matches!(args.only, Some(Step::Settings)),
        fail_fast: !args.keep_going,
    };
    let source = source_from_config(&config, args.fixtures)?;
    let pipeline = SyncPipeline::new(&config, source)?;
    let summary = pipeline.run(plan).await;

    let rendered = if args.json {
        serde_json::to_string_pretty(&summary)?
    } else {
        summary.render_text()
    };
    if summary.succeeded() {
        println!("{rendered}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{rendered}");
        Ok(ExitCode::FAILURE)
    }
}

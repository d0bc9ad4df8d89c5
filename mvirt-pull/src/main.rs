//! mvirt-pull - pull an ACI image into the local machine image store.

use anyhow::Result;
use clap::Parser;
use mvirt_pull::extractor::ExtractorConfig;
use mvirt_pull::progress::NotifyProgress;
use mvirt_pull::{AciPull, EventLoop, PullConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after an interrupt.
const EXIT_INTERRUPTED: i32 = 130;

/// Pull an ACI image.
#[derive(Parser)]
#[command(name = "mvirt-pull")]
#[command(version)]
#[command(about = "Pull an ACI image into the local machine image store")]
struct Args {
    /// Image store directory
    #[arg(long, default_value = mvirt_pull::staging::DEFAULT_IMAGE_ROOT)]
    image_root: PathBuf,

    /// Replace an existing local image
    #[arg(long)]
    force: bool,

    /// Extractor program, invoked as `<PROGRAM> --numeric-owner -C <dir> -px`
    #[arg(long, value_name = "PROGRAM")]
    tar: Option<String>,

    /// Image name, e.g. example.com/app
    name: String,

    /// Version or label list, e.g. v1.0.0 or version=v1.0.0,os=linux
    label: String,

    /// Name of the local copy
    local: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_pull=info".parse()?))
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let code = runtime.block_on(run(args))?;
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let event_loop = EventLoop::current()?;

    let mut config = PullConfig::default();
    if let Some(program) = args.tar {
        config.extractor = ExtractorConfig {
            program,
            ..ExtractorConfig::default()
        };
    }

    let mut pull = AciPull::new(Some(event_loop.clone()), Some(&args.image_root), None)?
        .with_config(config)
        .with_progress_sink(Box::new(NotifyProgress::from_env()));

    pull.start(&args.name, &args.label, args.local.as_deref(), args.force)?;
    info!(name = %args.name, label = %args.label, "Pulling image");

    tokio::select! {
        _ = pull.run() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cleaning up");
            drop(pull);
            return Ok(EXIT_INTERRUPTED);
        }
    }

    Ok(event_loop.wait().await)
}

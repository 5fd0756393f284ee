use clap::Parser;
use render_core::cli::{load_config, setup_logging, Cli, CliRunner};
use render_core::metrics::install_prometheus;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose);

    info!("Starting render-core v{}", env!("CARGO_PKG_VERSION"));

    // The recorder must exist before any metric handle is registered.
    let prometheus = if args.metrics {
        match install_prometheus() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    } else {
        None
    };

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(2);
        }
    };
    let runner = CliRunner::new(config);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = signal::ctrl_c() => {
            info!("Received interrupt; shutting down");
            Ok(())
        }
    };

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("render-core stopped");
    Ok(())
}

//! torpool entry point.
//!
//! Resolves configuration, runs the Integrator, and maps the outcome to
//! the documented exit codes.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torpool::{integrator, Config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting torpool");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match integrator::run(config).await {
        Ok(()) => {
            info!("torpool stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

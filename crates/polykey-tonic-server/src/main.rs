use clap::Parser;
use polykey_tonic_server::server::{
    config::{CliArgs, ServerConfig},
    host::polykey_host,
    shutdown::{OsSignals, ShutdownCoordinator},
    telemetry::init_telemetry,
};
use std::process::ExitCode;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry(config.log_format)?;

    if cfg!(debug_assertions) {
        tracing::debug!(?config, "starting with full config");
    }

    // Install handlers before binding so an early signal is not lost.
    let signals = OsSignals::install()?;

    let host = match polykey_host(config).bind().await {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return Ok(ExitCode::FAILURE);
        }
    };

    let coordinator = ShutdownCoordinator::for_host(&host);
    if let Err(e) = coordinator.run(host, signals).await {
        tracing::error!(error = %e, "server failed");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

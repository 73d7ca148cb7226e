//! Daemon entry point.
//!
//! No configuration file; the only argument a service manager may supply
//! is the log level. Exit code 0 on a clean stop, non-zero when startup
//! fails (no persistent-disk adapter, or no working driver channel).

use clap::Parser;

/// Persistent-disk snapshot agent
#[derive(Parser, Debug)]
#[command(name = "pdvss-agent", version, about = "Persistent-disk snapshot agent")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(windows)]
#[tokio::main]
async fn main() {
    use std::sync::Arc;

    use tracing::{error, info};

    use pdvss_agent::service::AgentService;
    use pdvss_core::windows::{NamedGateEvents, ScsiAdapter, WindowsTopology};

    let args = Args::parse();
    init_tracing(&args.log_level);
    info!("pdvss-agent v{} starting", env!("CARGO_PKG_VERSION"));

    let adapter = match ScsiAdapter::discover() {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!(error = %e, "no persistent-disk adapter on this machine");
            std::process::exit(1);
        }
    };

    let service = AgentService::new(
        adapter,
        Arc::new(WindowsTopology),
        Arc::new(NamedGateEvents),
        Arc::new(vss::CrashConsistentCoordinator),
    );

    let handle = match service.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "agent failed to start");
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("stop requested");
    service.stop(handle).await;
}

/// Coordinator wiring for builds without the vendor snapshot SDK.
#[cfg(windows)]
mod vss {
    use pdvss_core::coordinator::{BackupSession, Coordinator, SessionContext};
    use pdvss_proto::{PdError, PdResult};

    /// Coordinator used when no volume-snapshot SDK transport is linked
    /// into the build. The SDK surface is C++-only and lives outside this
    /// workspace; without it every session attempt fails, the host is
    /// told preparation failed, and it falls back to a crash-consistent
    /// snapshot instead of hanging on a freeze that cannot happen.
    pub struct CrashConsistentCoordinator;

    impl Coordinator for CrashConsistentCoordinator {
        fn create_session(&self, _context: SessionContext) -> PdResult<Box<dyn BackupSession>> {
            Err(PdError::Coordinator(
                "volume-snapshot SDK transport not linked".to_string(),
            ))
        }
    }
}

#[cfg(not(windows))]
fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    tracing::error!("pdvss-agent drives a Windows guest snapshot stack and cannot run here");
    std::process::exit(1);
}

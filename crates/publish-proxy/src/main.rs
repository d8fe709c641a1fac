//! publish-proxy CLI entry point.
//!
//! Runs the publish/proxy HTTP server on localhost until interrupted.
//! Agents started while running are killed on exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use publish_proxy::config::DEFAULT_EXECUTABLE;
use publish_proxy::{start_server, AppState, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "publish-proxy")]
#[command(about = "Launch notebook publishing agents and proxy their UI")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "PUBLISH_PROXY_BIND", default_value = "127.0.0.1:8765")]
    bind: SocketAddr,

    /// Base URL of the hosting editor; routes are mounted at {base-url}/connect-jupyterlab
    #[arg(long, env = "PUBLISH_PROXY_BASE_URL", default_value = "/")]
    base_url: String,

    /// Publishing helper to launch for each notebook
    #[arg(long, env = "PUBLISH_PROXY_EXECUTABLE", default_value = DEFAULT_EXECUTABLE)]
    executable: PathBuf,

    /// Publishing target passed to the helper
    #[arg(long, env = "PUBLISH_PROXY_TARGET", default_value = "dogfood")]
    target: String,

    /// Seconds to wait for a helper to report its URL
    #[arg(long, env = "PUBLISH_PROXY_LAUNCH_TIMEOUT", default_value = "30")]
    launch_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = ProxyConfig {
        bind_addr: cli.bind,
        base_url: cli.base_url,
        executable: cli.executable,
        target: cli.target,
        launch_timeout: Duration::from_secs(cli.launch_timeout),
    };

    info!("publish-proxy starting...");
    info!("Configuration:");
    info!("  Bind: {}", config.bind_addr);
    info!("  Mount: {}", config.mount_path());
    info!("  Executable: {:?}", config.executable);
    info!("  Target: {}", config.target);
    info!("  Launch timeout: {:?}", config.launch_timeout);

    let state = Arc::new(AppState::new(&config));
    start_server(state, config.bind_addr).await?;

    tokio::signal::ctrl_c().await?;
    info!("publish-proxy shutting down");

    Ok(())
}

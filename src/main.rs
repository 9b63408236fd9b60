use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use upgrade_relay::{config::DEFAULT_CONFIG_FILE, load_config, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_path)?;
    info!(
        config_file = %config_path.display(),
        listen_addr = %config.listen.addr(),
        ws_path = %config.routing.ws_path,
        framed_target = %format_args!("{}:{}", config.routing.framed.host, config.routing.framed.port),
        raw_target = %format_args!("{}:{}", config.routing.raw.host, config.routing.raw.port),
        buffer_size = config.relay.buffer_size,
        keepalive_secs = config.relay.keepalive_secs,
        "Configuration loaded"
    );

    for name in config.looping_targets() {
        warn!(target_name = name, "Upstream points at the relay's own listening port");
    }

    let addr = config.listen.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen_addr = %addr, error = %e, "Failed to start server");
            return Err(e).with_context(|| format!("Failed to bind to address {addr}"));
        }
    };

    info!(listen_addr = %addr, "Relay listening");

    serve(listener, Arc::new(config)).await;
    Ok(())
}

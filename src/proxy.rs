use anyhow::{Context, Result, bail};
use std::{sync::Arc, time::Instant};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::keepalive::{Deadline, enable_tcp_keepalive, keep_alive};
use crate::relay::{Direction, copy_stream};
use crate::target::{Target, resolve_payload};

/// Reply sent to clients routed to the raw upstream.
pub const UPGRADE_RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: Websocket\r\nConnection: Upgrade\r\n\r\n";

/// Accepts connections forever, one task per client. Accept failures are
/// logged and do not stop the loop.
pub async fn serve(listener: TcpListener, config: Arc<Config>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &config).await {
                error!(client_addr = %addr, error = %format_args!("{e:#}"), "Connection failed");
            }
        });
    }
}

#[tracing::instrument(skip(client, config), fields(client_addr = %client.peer_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string())))]
pub async fn handle_connection(mut client: TcpStream, config: &Config) -> Result<()> {
    info!("Client connected");

    let mut buffer = vec![0u8; config.relay.buffer_size];
    let size = client
        .read(&mut buffer)
        .await
        .context("Failed to read initial payload from client")?;
    if size == 0 {
        bail!("Client closed the connection before sending any data");
    }

    let payload = &buffer[..size];
    debug!(
        bytes = size,
        payload = %String::from_utf8_lossy(payload).escape_debug(),
        "Initial payload received"
    );

    let target = resolve_payload(&config.routing, payload)?;
    let target_addr = target.addr();

    debug!(target_addr = %target_addr, framed = target.framed, "Attempting to connect to target server");
    let mut upstream = TcpStream::connect(&target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;
    info!(target_addr = %target_addr, framed = target.framed, "Connected to target server");

    if target.framed {
        upstream
            .write_all(payload)
            .await
            .context("Failed to forward initial payload to target")?;
    } else {
        client
            .write_all(UPGRADE_RESPONSE)
            .await
            .context("Failed to send upgrade response to client")?;
    }

    let session = Session {
        client,
        upstream,
        target,
        started: Instant::now(),
    };
    session.run(buffer, config).await;
    Ok(())
}

/// One client paired with its upstream. Both connections are closed when
/// [`Session::run`] returns.
pub struct Session {
    pub client: TcpStream,
    pub upstream: TcpStream,
    pub target: Target,
    pub started: Instant,
}

impl Session {
    /// Relays both directions until each has finished. `client_buffer` is
    /// reused for the client -> upstream direction.
    pub async fn run(self, client_buffer: Vec<u8>, config: &Config) {
        let interval = config.relay.keepalive_interval();
        for stream in [&self.client, &self.upstream] {
            if let Err(e) = enable_tcp_keepalive(stream, interval) {
                warn!(error = %e, "Failed to enable TCP keepalive");
            }
        }

        let deadline = Deadline::new(interval);
        let (client_reader, client_writer) = self.client.into_split();
        let (upstream_reader, upstream_writer) = self.upstream.into_split();

        let to_upstream = copy_stream(
            client_reader,
            upstream_writer,
            client_buffer,
            deadline.watch(),
            Direction::ClientToUpstream,
        );
        let to_client = copy_stream(
            upstream_reader,
            client_writer,
            vec![0u8; config.relay.buffer_size],
            deadline.watch(),
            Direction::UpstreamToClient,
        );

        tokio::spawn(keep_alive(deadline, interval));

        let (sent, received) = tokio::join!(to_upstream, to_client);

        info!(
            target_addr = %self.target.addr(),
            framed = self.target.framed,
            bytes_sent = sent.unwrap_or_default(),
            bytes_received = received.unwrap_or_default(),
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

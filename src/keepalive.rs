use anyhow::{Result, bail};
use socket2::{SockRef, TcpKeepalive};
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at, sleep_until},
};
use tracing::debug;

/// Session-wide I/O deadline shared by both copy directions.
///
/// Reads and writes run through a [`DeadlineWatch`] fail with
/// [`io::ErrorKind::TimedOut`] once the deadline passes. The keepalive guard
/// pushes it forward while the session lives; a failing direction pulls it to
/// now so its sibling stops at the next pending operation.
#[derive(Debug)]
pub struct Deadline {
    tx: watch::Sender<Instant>,
}

impl Deadline {
    #[must_use]
    pub fn new(horizon: Duration) -> Arc<Self> {
        let (tx, _) = watch::channel(Instant::now() + horizon);
        Arc::new(Self { tx })
    }

    #[must_use]
    pub fn current(&self) -> Instant {
        *self.tx.borrow()
    }

    /// Moves the deadline to now + `horizon`. Fails once nothing watches the
    /// deadline any more, which means the session is over.
    pub fn extend(&self, horizon: Duration) -> Result<Instant> {
        let at = Instant::now() + horizon;
        if self.tx.send(at).is_err() {
            bail!("session deadline has no watchers");
        }
        Ok(at)
    }

    pub fn expire(&self) {
        self.tx.send_replace(Instant::now());
    }

    #[must_use]
    pub fn watch(self: &Arc<Self>) -> DeadlineWatch {
        DeadlineWatch {
            rx: self.tx.subscribe(),
            deadline: Arc::clone(self),
        }
    }

    /// Resolves when every [`DeadlineWatch`] has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[derive(Debug)]
pub struct DeadlineWatch {
    rx: watch::Receiver<Instant>,
    deadline: Arc<Deadline>,
}

impl DeadlineWatch {
    /// Awaits `op` unless the session deadline passes first. Extensions made
    /// while waiting are honoured.
    pub async fn run<F: Future>(&mut self, op: F) -> io::Result<F::Output> {
        tokio::pin!(op);

        loop {
            let at = *self.rx.borrow_and_update();
            if at <= Instant::now() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "session deadline exceeded",
                ));
            }

            tokio::select! {
                out = &mut op => return Ok(out),
                () = sleep_until(at) => {}
                changed = self.rx.changed() => {
                    // The sender lives in the `Deadline` this watch holds, so
                    // this cannot fail; falling through keeps the loop from spinning.
                    if changed.is_err() {
                        return Ok(op.await);
                    }
                }
            }
        }
    }

    pub fn expire(&self) {
        self.deadline.expire();
    }
}

/// Keeps an idle but live session from timing out.
///
/// Every half `interval` the deadline is pushed to now + `interval`. The guard
/// ends on its own when the extension fails or when both copy directions have
/// dropped their watches.
pub async fn keep_alive(deadline: Arc<Deadline>, interval: Duration) {
    let period = (interval / 2).max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match deadline.extend(interval) {
                    Ok(at) => debug!(
                        remaining_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Session deadline extended"
                    ),
                    Err(e) => {
                        debug!(reason = %e, "Keepalive stopped");
                        return;
                    }
                }
            }
            () = deadline.closed() => {
                debug!("Session closed, keepalive stopped");
                return;
            }
        }
    }
}

/// Largest idle time Linux accepts for `TCP_KEEPIDLE`.
pub const MAX_TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(32_767);

/// Enables SO_KEEPALIVE so the kernel probes the peer after `idle` of silence.
/// `idle` is capped at [`MAX_TCP_KEEPALIVE_IDLE`].
pub fn enable_tcp_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle.min(MAX_TCP_KEEPALIVE_IDLE));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

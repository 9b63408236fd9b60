//! Upgrade Relay
//!
//! A single-port TCP relay that reads the request line of each new connection
//! and routes it either to a framed (WebSocket) upstream, which receives the
//! client's opening bytes verbatim, or to a raw upstream, for which the relay
//! answers the HTTP upgrade itself. Bytes are then copied both ways until the
//! session ends.

pub mod config;
pub mod keepalive;
pub mod proxy;
pub mod relay;
pub mod target;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, RelayConfig, RoutingConfig, TargetConfig, load_config};
pub use keepalive::{Deadline, DeadlineWatch, keep_alive};
pub use proxy::{Session, UPGRADE_RESPONSE, handle_connection, serve};
pub use relay::{Direction, copy_stream};
pub use target::{Target, request_path, resolve, resolve_payload};

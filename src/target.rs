use anyhow::{Result, anyhow};

use crate::config::RoutingConfig;

/// Resolved upstream for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// The upstream speaks the client's original framing and completes the
    /// opening handshake itself.
    pub framed: bool,
}

impl Target {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Extracts the path token from the request line of the first payload
/// Format: "METHOD PATH VERSION" - returns the second whitespace-delimited field
pub fn request_path(payload: &[u8]) -> Result<String> {
    let line_end = payload
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(payload.len());
    let line = String::from_utf8_lossy(&payload[..line_end]);

    line.split_whitespace()
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Malformed request line, no path token: {:?}", line.trim_end()))
}

/// Picks the upstream for a request path. Anything other than the marker path
/// goes to the raw upstream.
#[must_use]
pub fn resolve(routing: &RoutingConfig, path: &str) -> Target {
    let (upstream, framed) = if path == routing.ws_path {
        (&routing.framed, true)
    } else {
        (&routing.raw, false)
    };

    Target {
        host: upstream.host.clone(),
        port: upstream.port,
        framed,
    }
}

pub fn resolve_payload(routing: &RoutingConfig, payload: &[u8]) -> Result<Target> {
    let path = request_path(payload)?;
    Ok(resolve(routing, &path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn routing() -> RoutingConfig {
        RoutingConfig {
            ws_path: "/ws/".to_string(),
            framed: TargetConfig {
                host: "10.0.0.1".to_string(),
                port: 8080,
            },
            raw: TargetConfig {
                host: "10.0.0.2".to_string(),
                port: 22,
            },
        }
    }

    mod path_extraction {
        use super::*;

        #[test]
        fn takes_second_token_of_first_line() {
            let path = request_path(b"GET /ws/ HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
            assert_eq!(path, "/ws/");
        }

        #[test]
        fn ignores_later_lines() {
            let path = request_path(b"GET /shell HTTP/1.1\r\nX-Path: /ws/ extra\r\n").unwrap();
            assert_eq!(path, "/shell");
        }

        #[test]
        fn accepts_line_without_terminator() {
            assert_eq!(request_path(b"CONNECT /tunnel").unwrap(), "/tunnel");
        }

        #[test]
        fn tolerates_invalid_utf8_after_path() {
            let path = request_path(b"GET /x \xff\xfe\r\n").unwrap();
            assert_eq!(path, "/x");
        }

        #[test]
        fn rejects_single_token() {
            let err = request_path(b"GARBAGE\r\n\r\n").unwrap_err();
            assert!(err.to_string().contains("no path token"));
        }

        #[test]
        fn rejects_empty_payload() {
            assert!(request_path(b"").is_err());
        }

        #[test]
        fn rejects_path_only_on_second_line() {
            assert!(request_path(b"GET\n/ws/ HTTP/1.1\r\n").is_err());
        }
    }

    mod dispatch {
        use super::*;

        #[test]
        fn marker_path_selects_framed_upstream() {
            let target = resolve(&routing(), "/ws/");
            assert_eq!(
                target,
                Target {
                    host: "10.0.0.1".to_string(),
                    port: 8080,
                    framed: true,
                }
            );
            assert_eq!(target.addr(), "10.0.0.1:8080");
        }

        #[test]
        fn other_paths_select_raw_upstream() {
            for path in ["", "/", "/ws", "/ws/x", "/WS/", "/shell", "*"] {
                let target = resolve(&routing(), path);
                assert!(!target.framed, "path {path:?} should be raw");
                assert_eq!(target.addr(), "10.0.0.2:22");
            }
        }

        #[test]
        fn resolution_is_deterministic() {
            let routing = routing();
            assert_eq!(resolve(&routing, "/ws/"), resolve(&routing, "/ws/"));
            assert_eq!(resolve(&routing, "/a"), resolve(&routing, "/a"));
        }

        #[test]
        fn payload_resolution_follows_request_line() {
            let routing = routing();
            assert!(resolve_payload(&routing, b"GET /ws/ HTTP/1.1\r\n\r\n").unwrap().framed);
            assert!(!resolve_payload(&routing, b"GET /shell HTTP/1.1\r\n\r\n").unwrap().framed);
            assert!(resolve_payload(&routing, b"\r\n").is_err());
        }
    }
}

use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

/// Porch client configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct Config {
    /// Room server base URL (defaults to a local relay).
    pub server: String,
    /// STUN servers handed to the media stack.
    pub stun_servers: Vec<String>,
    /// How long a peer negotiation may sit waiting before it is failed.
    /// `None` disables the deadline.
    pub negotiation_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        let server =
            env::var("PORCH_SERVER").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        // Normalize localhost to IPv4 so macOS does not prefer ::1.
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };

        let stun_servers = env::var("PORCH_STUN")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(default_stun_servers);

        let negotiation_timeout = match env::var("PORCH_NEGOTIATION_TIMEOUT_SECS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => default_negotiation_timeout(),
            },
            Err(_) => default_negotiation_timeout(),
        };

        Self {
            server,
            stun_servers,
            negotiation_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            stun_servers: default_stun_servers(),
            negotiation_timeout: default_negotiation_timeout(),
        }
    }
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_negotiation_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

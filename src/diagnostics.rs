// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use codec::TimeDuration;

use crate::collections::LruCache;
use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};

/// Probe cache entries stay valid this long.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Short timeout for the raw socket probe.
const SOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of the raw TCP reachability probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketProbe {
    Reachable,
    DnsError,
    ConnectionRefused,
    Timeout,
}

/// Outcome of the HTTP health probe.
#[derive(Clone, Debug)]
pub struct HealthProbe {
    pub reachable: bool,
    pub server_version: Option<String>,
    pub response_time: TimeDuration,
}

/// Heuristic database existence classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DatabaseExistence {
    Exists,

    /// The metadata endpoint answered 401/403, so the name resolves but
    /// is protected; it likely exists unpublished.
    LikelyExists,

    NotExists,

    /// The subscribe endpoint answered 426; the database exists but the
    /// client must upgrade.
    NeedsUpgrade,

    Unknown,
}

/// Result of the full preflight check.
#[derive(Clone, Debug)]
pub struct PreflightReport {
    pub socket: SocketProbe,
    pub health: Option<HealthProbe>,
    pub database: DatabaseExistence,
}

impl PreflightReport {
    /// Returns true if connecting is worth attempting at all.
    #[must_use]
    pub fn server_reachable(&self) -> bool {
        self.socket == SocketProbe::Reachable
            || self.health.as_ref().map_or(false, |probe| probe.reachable)
    }
}

/// Client-side reachability probes run before the subscribe handshake,
/// and the mapping of handshake failures onto typed errors.
///
/// Probe results are cached per (host, database) with a TTL so repeated
/// reconnect attempts stay cheap.
pub struct ConnectionDiagnostics {
    client: reqwest::Client,
    cache: Mutex<LruCache<String, (DatabaseExistence, Instant)>>,
    cache_ttl: Duration,
}

impl Default for ConnectionDiagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ConnectionDiagnostics {
    #[must_use]
    pub fn new(cache_ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache: Mutex::new(LruCache::new(64)),
            cache_ttl,
        }
    }

    /// Probe the raw socket with a short timeout.
    pub async fn check_socket(&self, options: &ConnectOptions) -> SocketProbe {
        let port = options
            .port()
            .unwrap_or(if options.ssl() { 443 } else { 80 });
        let address = format!("{}:{port}", options.host());
        match tokio::time::timeout(
            SOCKET_PROBE_TIMEOUT,
            tokio::net::TcpStream::connect(&address),
        )
        .await
        {
            Ok(Ok(_stream)) => SocketProbe::Reachable,
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                SocketProbe::ConnectionRefused
            }
            Ok(Err(err)) => {
                log::debug!("Socket probe for {address} failed: {err}");
                SocketProbe::DnsError
            }
            Err(_elapsed) => SocketProbe::Timeout,
        }
    }

    /// Probe the HTTP health endpoint, capturing the server version.
    pub async fn check_health(&self, options: &ConnectOptions) -> HealthProbe {
        let url = options.health_url();
        let start = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let server_version = response
                    .headers()
                    .get("spacetime-version")
                    .or_else(|| response.headers().get(http::header::SERVER))
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                HealthProbe {
                    reachable: response.status().is_success(),
                    server_version,
                    response_time: TimeDuration::from_std(start.elapsed()),
                }
            }
            Err(err) => {
                log::debug!("Health probe for {url} failed: {err}");
                HealthProbe {
                    reachable: false,
                    server_version: None,
                    response_time: TimeDuration::from_std(start.elapsed()),
                }
            }
        }
    }

    /// Heuristic database existence check, cached per (host, database).
    pub async fn check_database_exists(&self, options: &ConnectOptions) -> DatabaseExistence {
        let key = format!("{}/{}", options.host(), options.database());
        if let Some((existence, stored_at)) = self.cache_get(&key) {
            if stored_at.elapsed() < self.cache_ttl {
                return existence;
            }
        }

        let url = options.database_url();
        let existence = match self.client.get(&url).send().await {
            Ok(response) => match response.status().as_u16() {
                200..=299 => DatabaseExistence::Exists,
                401 | 403 => DatabaseExistence::LikelyExists,
                404 => DatabaseExistence::NotExists,
                426 => DatabaseExistence::NeedsUpgrade,
                _ => DatabaseExistence::Unknown,
            },
            Err(err) => {
                log::debug!("Database probe for {url} failed: {err}");
                DatabaseExistence::Unknown
            }
        };
        self.cache_put(key, existence);
        existence
    }

    /// Run the probes in order, stopping early when the host is down.
    pub async fn run_preflight(&self, options: &ConnectOptions) -> PreflightReport {
        let socket = self.check_socket(options).await;
        if socket != SocketProbe::Reachable {
            return PreflightReport {
                socket,
                health: None,
                database: DatabaseExistence::Unknown,
            };
        }
        let health = self.check_health(options).await;
        let database = if health.reachable {
            self.check_database_exists(options).await
        } else {
            DatabaseExistence::Unknown
        };
        PreflightReport {
            socket,
            health: Some(health),
            database,
        }
    }

    /// Drop the cached probe for one (host, database).
    pub fn invalidate(&self, options: &ConnectOptions) {
        let key = format!("{}/{}", options.host(), options.database());
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&key);
        }
    }

    fn cache_get(&self, key: &str) -> Option<(DatabaseExistence, Instant)> {
        match self.cache.lock() {
            Ok(mut cache) => cache.get(&key.to_string()),
            Err(_) => None,
        }
    }

    fn cache_put(&self, key: String, existence: DatabaseExistence) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, (existence, Instant::now()));
        }
    }

    /// Refine a handshake failure with probe knowledge.
    ///
    /// A 404 becomes database-not-found when the probe is confident the
    /// name is absent, database-not-published when the name likely
    /// exists, and otherwise keeps the generic kind with an
    /// unpublished hint.
    #[must_use]
    pub fn refine_handshake_error(
        &self,
        error: Error,
        existence: DatabaseExistence,
        database: &str,
    ) -> Error {
        let message = error.message().to_lowercase();
        if error.kind() == ErrorKind::DatabaseNotFound {
            return match existence {
                DatabaseExistence::NotExists => Error::from_string(
                    ErrorKind::DatabaseNotFound,
                    format!("Database '{database}' does not exist"),
                )
                .with_hint("Check the database name for typos"),
                DatabaseExistence::LikelyExists | DatabaseExistence::NeedsUpgrade => {
                    Error::from_string(
                        ErrorKind::DatabaseNotPublished,
                        format!("Database '{database}' exists but is not published"),
                    )
                    .with_hint(&format!("Run: spacetime publish {database}"))
                }
                DatabaseExistence::Exists | DatabaseExistence::Unknown => {
                    error.with_hint("The database may be unpublished")
                }
            };
        }
        if message.contains("protocol")
            && (message.contains("mismatch") || message.contains("rejected"))
        {
            return Error::from_string(ErrorKind::ProtocolMismatch, error.message().to_string())
                .with_hint("Switch the client protocol to one the server supports");
        }
        if message.contains("timed out") || message.contains("timeout") {
            return Error::from_string(
                ErrorKind::ConnectionTimeout,
                error.message().to_string(),
            );
        }
        match error.kind() {
            ErrorKind::Authentication
            | ErrorKind::ProtocolMismatch
            | ErrorKind::ServerNotAvailable
            | ErrorKind::ConnectionTimeout
            | ErrorKind::WebSocketHandshake => error,
            _ => {
                let cause = error.message().to_string();
                Error::from_string(
                    ErrorKind::Connection,
                    format!("Failed to connect to database '{database}'"),
                )
                .with_cause(&cause)
                .with_hint("Verify the server address and that the database is published")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostics() -> ConnectionDiagnostics {
        ConnectionDiagnostics::default()
    }

    #[test]
    fn test_404_refined_by_probe_confidence() {
        let base = || {
            Error::new(ErrorKind::DatabaseNotFound, "Server returned 404")
        };
        let refined = diagnostics().refine_handshake_error(
            base(),
            DatabaseExistence::NotExists,
            "demo",
        );
        assert_eq!(refined.kind(), ErrorKind::DatabaseNotFound);

        let refined = diagnostics().refine_handshake_error(
            base(),
            DatabaseExistence::LikelyExists,
            "demo",
        );
        assert_eq!(refined.kind(), ErrorKind::DatabaseNotPublished);
        assert!(refined.hint().unwrap_or_default().contains("spacetime publish demo"));

        let refined = diagnostics().refine_handshake_error(
            base(),
            DatabaseExistence::Unknown,
            "demo",
        );
        assert_eq!(refined.kind(), ErrorKind::DatabaseNotFound);
        assert!(refined.hint().unwrap_or_default().contains("unpublished"));
    }

    #[test]
    fn test_protocol_mismatch_text_detected() {
        let error = Error::new(
            ErrorKind::WebSocketHandshake,
            "Requested protocol v1.bsatn.spacetimedb was rejected",
        );
        let refined =
            diagnostics().refine_handshake_error(error, DatabaseExistence::Unknown, "demo");
        assert_eq!(refined.kind(), ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn test_timeout_text_detected() {
        let error = Error::new(ErrorKind::Connection, "operation timed out after 10s");
        let refined =
            diagnostics().refine_handshake_error(error, DatabaseExistence::Unknown, "demo");
        assert_eq!(refined.kind(), ErrorKind::ConnectionTimeout);
    }

    #[test]
    fn test_generic_error_gains_cause_and_hint() {
        let error = Error::new(ErrorKind::SocketError, "connection reset by peer");
        let refined =
            diagnostics().refine_handshake_error(error, DatabaseExistence::Unknown, "demo");
        assert_eq!(refined.kind(), ErrorKind::Connection);
        assert!(refined.cause().is_some());
        assert!(refined.hint().is_some());
    }

    #[tokio::test]
    async fn test_socket_probe_refused_port() {
        // Port 1 on localhost is almost certainly closed.
        let mut options = ConnectOptions::new("demo");
        options.set_host("127.0.0.1").set_port(Some(1));
        let probe = diagnostics().check_socket(&options).await;
        assert!(matches!(
            probe,
            SocketProbe::ConnectionRefused | SocketProbe::Timeout | SocketProbe::DnsError
        ));
    }
}

// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use codec::TimeDuration;

use crate::compress::CompressionConfig;
use crate::retry::RetryPolicy;

/// Wire encoding selected via WebSocket subprotocol.
///
/// A client advertises exactly one; the server either accepts it or
/// rejects the handshake.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Protocol {
    Json,
    Bsatn,
}

impl Protocol {
    /// Subprotocol token sent during the handshake.
    #[must_use]
    pub const fn subprotocol(self) -> &'static str {
        match self {
            Self::Json => "v1.json.spacetimedb",
            Self::Bsatn => "v1.bsatn.spacetimedb",
        }
    }
}

/// Reconnect backoff caps used internally by the session.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before 1-based reconnect attempt `attempt`, doubling from
    /// the initial delay up to the cap.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1).min(30));
        self.initial_delay
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }
}

/// Connection settings for a session.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    host: String,
    port: Option<u16>,
    database: String,
    db_identity: Option<String>,
    token: Option<String>,
    ssl: bool,
    protocol: Protocol,
    light_mode: bool,
    connect_timeout: Duration,
    preflight: bool,
    compression: CompressionConfig,
    reconnect: ReconnectConfig,
    retry_policy: RetryPolicy,
    energy_budget: u64,
    energy_budget_period: TimeDuration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: Some(3000),
            database: String::new(),
            db_identity: None,
            token: None,
            ssl: false,
            protocol: Protocol::Bsatn,
            light_mode: false,
            connect_timeout: Duration::from_secs(10),
            preflight: true,
            compression: CompressionConfig::default(),
            reconnect: ReconnectConfig::default(),
            retry_policy: RetryPolicy::standard(),
            energy_budget: 5000,
            energy_budget_period: TimeDuration::from_secs(3600),
        }
    }
}

impl ConnectOptions {
    /// Options for `database` on the default local host.
    #[must_use]
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..Self::default()
        }
    }

    pub fn set_host(&mut self, host: &str) -> &mut Self {
        self.host = host.to_string();
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_port(&mut self, port: Option<u16>) -> &mut Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn set_db_identity(&mut self, identity_hex: &str) -> &mut Self {
        self.db_identity = Some(identity_hex.to_string());
        self
    }

    #[must_use]
    pub fn db_identity(&self) -> Option<&str> {
        self.db_identity.as_deref()
    }

    pub fn set_token(&mut self, token: &str) -> &mut Self {
        self.token = Some(token.to_string());
        self
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_ssl(&mut self, ssl: bool) -> &mut Self {
        self.ssl = ssl;
        self
    }

    #[must_use]
    pub const fn ssl(&self) -> bool {
        self.ssl
    }

    pub fn set_protocol(&mut self, protocol: Protocol) -> &mut Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Request lightweight transaction updates without reducer metadata.
    pub fn set_light_mode(&mut self, light_mode: bool) -> &mut Self {
        self.light_mode = light_mode;
        self
    }

    #[must_use]
    pub const fn light_mode(&self) -> bool {
        self.light_mode
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Enable or disable the preflight reachability probe.
    pub fn set_preflight(&mut self, preflight: bool) -> &mut Self {
        self.preflight = preflight;
        self
    }

    #[must_use]
    pub const fn preflight(&self) -> bool {
        self.preflight
    }

    pub fn set_compression(&mut self, compression: CompressionConfig) -> &mut Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub const fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    pub fn set_reconnect(&mut self, reconnect: ReconnectConfig) -> &mut Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub const fn reconnect(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) -> &mut Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn set_energy_budget(&mut self, budget: u64, period: TimeDuration) -> &mut Self {
        self.energy_budget = budget;
        self.energy_budget_period = period;
        self
    }

    #[must_use]
    pub const fn energy_budget(&self) -> u64 {
        self.energy_budget
    }

    #[must_use]
    pub const fn energy_budget_period(&self) -> TimeDuration {
        self.energy_budget_period
    }

    /// Scheme and authority part of every URL for this server.
    #[must_use]
    fn authority(&self, ws: bool) -> String {
        let scheme = match (ws, self.ssl) {
            (true, true) => "wss",
            (true, false) => "ws",
            (false, true) => "https",
            (false, false) => "http",
        };
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}", self.host),
            None => format!("{scheme}://{}", self.host),
        }
    }

    /// WebSocket URL of the subscribe endpoint.
    #[must_use]
    pub fn subscribe_url(&self) -> String {
        let mut url = format!(
            "{}/v1/database/{}/subscribe",
            self.authority(true),
            self.database
        );
        if let Some(identity) = &self.db_identity {
            url.push_str("?db_identity=");
            url.push_str(identity);
        }
        url
    }

    /// HTTP URL of the server health endpoint.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}/health", self.authority(false))
    }

    /// HTTP URL of the database metadata endpoint.
    #[must_use]
    pub fn database_url(&self) -> String {
        format!("{}/v1/database/{}", self.authority(false), self.database)
    }

    /// Authorization header value derived from the token, if set.
    #[must_use]
    pub fn authorization_header(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| format!("Basic {}", base64::encode(format!("token:{token}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_url_shape() {
        let mut options = ConnectOptions::new("demo");
        assert_eq!(
            options.subscribe_url(),
            "ws://localhost:3000/v1/database/demo/subscribe"
        );
        options.set_ssl(true).set_db_identity("c0ffee");
        assert_eq!(
            options.subscribe_url(),
            "wss://localhost:3000/v1/database/demo/subscribe?db_identity=c0ffee"
        );
    }

    #[test]
    fn test_authorization_header() {
        let mut options = ConnectOptions::new("demo");
        assert!(options.authorization_header().is_none());
        options.set_token("secret");
        let header = options.authorization_header().unwrap();
        assert_eq!(header, format!("Basic {}", base64::encode("token:secret")));
    }

    #[test]
    fn test_reconnect_backoff_caps() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(reconnect.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(reconnect.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(reconnect.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_subprotocol_tokens() {
        assert_eq!(Protocol::Json.subprotocol(), "v1.json.spacetimedb");
        assert_eq!(Protocol::Bsatn.subprotocol(), "v1.bsatn.spacetimedb");
    }
}

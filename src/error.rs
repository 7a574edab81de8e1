// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio_tungstenite::tungstenite;

/// Represent the types of errors surfaced at the session boundary.
///
/// The taxonomy is closed: every error a user sees carries one of these
/// kinds, with the original cause attached as text when wrapping a
/// lower-level failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Generic connection failure.
    Connection,

    /// Transient failure the retry classifier accepts.
    Retryable,

    /// Host unreachable or health probe failed.
    ServerNotAvailable,

    /// An operation exceeded its timeout.
    ConnectionTimeout,

    /// Non-404, non-auth WebSocket handshake failure.
    WebSocketHandshake,

    /// 404 and diagnostics say the database name does not exist.
    DatabaseNotFound,

    /// 404 and diagnostics say the name exists but is unpublished.
    DatabaseNotPublished,

    /// 401/403 during handshake.
    Authentication,

    /// Server rejected the requested subprotocol.
    ProtocolMismatch,

    /// Reducer call or scheduled fire refused by the energy budget.
    OutOfEnergy,

    /// Energy level reached zero.
    EnergyExhausted,

    /// Circuit breaker is open and failing calls fast.
    CircuitOpen,

    /// Outbound call attempted before the identity handshake finished.
    NotConnected,

    /// Session closed while the operation was outstanding.
    ConnectionTerminated,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Socket stream error.
    SocketError,

    /// Scheduler rejected or failed a scheduled call.
    SchedulerError,

    /// Subscription lifecycle error reported by the server.
    SubscriptionError,

    /// mpsc channel error.
    ChannelError,
}

/// Error type shared by all client components.
#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,

    /// Suggested remediation, shown to users verbatim.
    hint: Option<String>,

    /// Text of the lower-level failure this error wraps.
    cause: Option<String>,

    /// Structured diagnostic key/value pairs.
    diagnostics: Vec<(String, String)>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self::from_string(kind, message.to_owned())
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            hint: None,
            cause: None,
            diagnostics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_owned());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: &str) -> Self {
        self.cause = Some(cause.to_owned());
        self
    }

    #[must_use]
    pub fn with_diagnostic(mut self, key: &str, value: &str) -> Self {
        self.diagnostics.push((key.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[(String, String)] {
        &self.diagnostics
    }

    /// Returns true if the retry classifier accepts this error.
    ///
    /// Transient transport conditions retry; definitive rejections like a
    /// missing database, a protocol mismatch or bad credentials do not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Retryable
                | ErrorKind::ConnectionTimeout
                | ErrorKind::ServerNotAvailable
                | ErrorKind::SocketError
        )
    }

    /// Returns true if a dropped connection with this error may be
    /// re-established automatically.
    #[must_use]
    pub const fn allows_reconnect(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::DatabaseNotFound
                | ErrorKind::DatabaseNotPublished
                | ErrorKind::Authentication
                | ErrorKind::ProtocolMismatch
                | ErrorKind::ConnectionTerminated
        )
    }

    #[must_use]
    pub fn not_connected() -> Self {
        Self::new(
            ErrorKind::NotConnected,
            "Session is not connected; identity handshake has not completed",
        )
    }

    #[must_use]
    pub fn terminated() -> Self {
        Self::new(ErrorKind::ConnectionTerminated, "Connection terminated")
    }

    #[must_use]
    pub fn circuit_open(failure_count: u32) -> Self {
        Self::from_string(
            ErrorKind::CircuitOpen,
            format!("Circuit breaker is open after {failure_count} failures"),
        )
        .with_hint("Wait for the recovery timeout before calling again")
    }

    #[must_use]
    pub fn out_of_energy(required: u64, available: u64) -> Self {
        Self::from_string(
            ErrorKind::OutOfEnergy,
            format!("Operation requires {required} quanta, {available} available"),
        )
        .with_diagnostic("required", &required.to_string())
        .with_diagnostic("available", &available.to_string())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " Hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::SocketError, format!("IoError {err}"))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::from_string(ErrorKind::SocketError, format!("Websocket error: {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err}"))
    }
}

impl From<codec::TimeError> for Error {
    fn from(err: codec::TimeError) -> Self {
        Self::from_string(ErrorKind::SchedulerError, format!("{err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("Json error: {err}"))
    }
}

// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::compress::{CompressionAlgorithm, COMPRESSION_HEADER};
use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};

/// One duplex WebSocket connection to the server.
///
/// A stream is single-use: after any transport error it must be replaced
/// by a fresh connect. Inbound frames are surfaced in on-wire order.
#[derive(Debug)]
pub struct Stream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,

    /// Algorithm the server selected during the handshake.
    negotiated: CompressionAlgorithm,
}

impl Stream {
    /// Open the subscribe endpoint and perform the WebSocket handshake.
    ///
    /// The request advertises exactly one subprotocol and the supported
    /// compression algorithms; an optional bearer token rides in the
    /// Authorization header.
    ///
    /// # Errors
    ///
    /// Returns error with the handshake failure mapped onto the error
    /// taxonomy: 401/403 to authentication, 404 to database-not-found
    /// (refined by diagnostics), rejected subprotocol to
    /// protocol-mismatch, timeouts and refused sockets to their
    /// retryable kinds.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        let url = options.subscribe_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| Error::from_string(
                ErrorKind::Connection,
                format!("Invalid connect URL {url}: {err}"),
            ))?;

        let subprotocol = options.protocol().subprotocol();
        let headers = request.headers_mut();
        headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(subprotocol),
        );
        let advertise = options.compression().advertise_value();
        if let Ok(value) = HeaderValue::from_str(&advertise) {
            headers.insert(COMPRESSION_HEADER, value);
        }
        if let Some(authorization) = options.authorization_header() {
            let value = HeaderValue::from_str(&authorization).map_err(|_| {
                Error::new(ErrorKind::Authentication, "Token contains invalid header bytes")
            })?;
            headers.insert(http::header::AUTHORIZATION, value);
        }

        let connect = connect_async(request);
        let (inner, response) =
            match tokio::time::timeout(options.connect_timeout(), connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => return Err(map_handshake_error(&err, &url)),
                Err(_elapsed) => {
                    return Err(Error::from_string(
                        ErrorKind::ConnectionTimeout,
                        format!(
                            "Handshake with {url} exceeded {:?}",
                            options.connect_timeout()
                        ),
                    ));
                }
            };

        // The server must accept the one subprotocol we advertised.
        let accepted = response
            .headers()
            .get(http::header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        if let Some(accepted) = accepted {
            if accepted != subprotocol {
                return Err(Error::from_string(
                    ErrorKind::ProtocolMismatch,
                    format!("Server selected subprotocol {accepted}, requested {subprotocol}"),
                )
                .with_hint("Switch the client protocol to one the server supports"));
            }
        }

        let negotiated = options.compression().parse_selection(
            response
                .headers()
                .get(COMPRESSION_HEADER)
                .and_then(|value| value.to_str().ok()),
        );
        log::info!("Connected to {url}, compression: {negotiated:?}");

        Ok(Self { inner, negotiated })
    }

    /// Compression algorithm negotiated for the life of this connection.
    #[must_use]
    pub const fn negotiated_compression(&self) -> CompressionAlgorithm {
        self.negotiated
    }

    /// Read the next data frame.
    ///
    /// Control frames are handled internally. Returns `None` once the
    /// peer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns error if the socket failed; the stream is unusable
    /// afterwards.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        while let Some(message) = self.inner.next().await {
            match message? {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Text(text) => return Ok(Some(text.into_bytes())),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    log::info!("Server closed connection: {frame:?}");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Write one binary frame.
    ///
    /// # Errors
    ///
    /// Returns error if the socket failed; the stream is unusable
    /// afterwards.
    pub async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), Error> {
        self.inner.send(Message::Binary(frame)).await?;
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Err(err) = self.inner.close(None).await {
            log::debug!("Close handshake failed: {err}");
        }
    }
}

fn map_handshake_error(err: &tokio_tungstenite::tungstenite::Error, url: &str) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                404 => Error::from_string(
                    ErrorKind::DatabaseNotFound,
                    format!("Server returned 404 for {url}"),
                )
                .with_hint("The database may not exist or may be unpublished")
                .with_diagnostic("status", "404")
                .with_diagnostic("url", url),
                401 | 403 => Error::from_string(
                    ErrorKind::Authentication,
                    format!("Server rejected credentials with {status}"),
                )
                .with_hint("Check the auth token; it may be expired or malformed")
                .with_diagnostic("status", status.as_str()),
                _ => Error::from_string(
                    ErrorKind::WebSocketHandshake,
                    format!("Handshake with {url} failed with status {status}"),
                )
                .with_diagnostic("status", status.as_str())
                .with_diagnostic("url", url),
            }
        }
        WsError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::from_string(
                ErrorKind::ServerNotAvailable,
                format!("Connection refused by {url}"),
            )
            .with_hint("Is the server running?"),
            std::io::ErrorKind::TimedOut => Error::from_string(
                ErrorKind::ConnectionTimeout,
                format!("Connection to {url} timed out"),
            ),
            _ => Error::from_string(ErrorKind::SocketError, format!("IoError {io_err}"))
                .with_cause(&io_err.to_string()),
        },
        other => Error::from_string(
            ErrorKind::WebSocketHandshake,
            format!("Handshake with {url} failed"),
        )
        .with_cause(&other.to_string()),
    }
}

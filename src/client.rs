//! The requester side of the bus: short-lived sessions invoking endpoints.
//!
//! A [`Client`] opens one [`Session`] per logical request (or small batch),
//! performs the request over it, and closes it on every exit path. Sessions
//! target a single shard via its identifier, or every shard of a bot via
//! the literal identifier `all`.

use crate::model::requester::Frame;
use futures_util::{SinkExt, StreamExt};
use http::{Error as HttpError, Request};
use serde_json::{Error as JsonError, Value};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, time};
use tokio_tungstenite::{
    tungstenite::{Error as TungsteniteError, Message},
    MaybeTlsStream, WebSocketStream,
};

const RETRY_DELAY: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An error occurred while opening a session or performing a request.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Building the HTTP request to initialize a connection failed.
    BuildingConnectionRequest {
        /// The source of the error from the `http` crate.
        source: HttpError,
    },
    /// Connecting to the broker failed.
    Connecting {
        /// The source of the error from the `tungstenite` crate.
        source: TungsteniteError,
    },
    /// Parsing a reply as JSON failed.
    Deserializing {
        /// The source of the error from the `serde_json` crate.
        source: JsonError,
    },
    /// Sending a frame over the session failed.
    Sending {
        /// The source of the error from the `tungstenite` crate.
        source: TungsteniteError,
    },
    /// The transport closed before a reply arrived, and the one permitted
    /// retry failed too.
    TransportClosed,
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::BuildingConnectionRequest { .. } => {
                f.write_str("failed to build connection request")
            }
            Self::Connecting { .. } => f.write_str("failed to connect to the cluster"),
            Self::Deserializing { .. } => f.write_str("failed to parse a reply as json"),
            Self::Sending { .. } => f.write_str("failed to send a frame over the session"),
            Self::TransportClosed => f.write_str("the transport closed before a reply arrived"),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BuildingConnectionRequest { source } => Some(source),
            Self::Connecting { source } => Some(source),
            Self::Deserializing { source } => Some(source),
            Self::Sending { source } => Some(source),
            Self::TransportClosed => None,
        }
    }
}

/// Handle opening requester sessions against one broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Client {
    address: SocketAddr,
    secret_key: Option<String>,
}

impl Client {
    /// Create a client for the broker at the given address.
    pub const fn new(address: SocketAddr, secret_key: Option<String>) -> Self {
        Self {
            address,
            secret_key,
        }
    }

    /// Return the address of the broker the client connects to.
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Probe whether a session against the given target can be established
    /// and answers.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connecting`] when no connection can be opened.
    pub async fn is_alive(&self, bot_id: u64, identifier: &str) -> Result<bool, ClientError> {
        let mut session = match self.session(bot_id, identifier).await {
            Ok(session) => session,
            Err(ClientError::TransportClosed) => return Ok(false),
            Err(source) => return Err(source),
        };

        let alive = session.is_alive().await;
        session.close().await;

        Ok(alive)
    }

    /// Invoke an endpoint on a single shard and return its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connecting`] when no connection can be opened
    /// and [`ClientError::TransportClosed`] when the session breaks during
    /// the request and the one permitted retry fails too.
    pub async fn request(
        &self,
        bot_id: u64,
        identifier: &str,
        endpoint: &str,
        kwargs: Value,
    ) -> Result<Value, ClientError> {
        let mut session = self.session(bot_id, identifier).await?;
        let result = session.request(endpoint, kwargs).await;
        session.close().await;

        result
    }

    /// Invoke an endpoint on every registered shard of a bot.
    ///
    /// With `wait_response` the reply is the aggregated mapping of shard
    /// identifiers to responses; without it, a short acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`request`].
    ///
    /// [`request`]: Self::request
    pub async fn request_all(
        &self,
        bot_id: u64,
        endpoint: &str,
        wait_response: bool,
        kwargs: Value,
    ) -> Result<Value, ClientError> {
        let mut session = self.session(bot_id, "all").await?;
        let result = session.request_with(endpoint, wait_response, kwargs).await;
        session.close().await;

        result
    }

    async fn session(&self, bot_id: u64, identifier: &str) -> Result<Session, ClientError> {
        Session::connect(
            self.address,
            bot_id,
            identifier,
            self.secret_key.as_deref(),
        )
        .await
    }
}

/// One open requester connection against the broker.
///
/// A session is bound to the `(bot_id, identifier)` target it was opened
/// with; open a new session to address a different target.
#[derive(Debug)]
pub struct Session {
    socket: Socket,
}

impl Session {
    /// Open a session and probe it once.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connecting`] when the connection can't be
    /// opened and [`ClientError::TransportClosed`] when the initial probe
    /// goes unanswered.
    pub async fn connect(
        address: SocketAddr,
        bot_id: u64,
        identifier: &str,
        secret_key: Option<&str>,
    ) -> Result<Self, ClientError> {
        let request = connect_request(address, bot_id, identifier, secret_key)?;

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|source| ClientError::Connecting { source })?;

        let mut session = Self { socket };

        let start = Instant::now();
        if session.is_alive().await {
            tracing::debug!("connection test took {:?}", start.elapsed());

            Ok(session)
        } else {
            session.close().await;

            Err(ClientError::TransportClosed)
        }
    }

    /// Probe the session, returning `false` when the transport has closed.
    pub async fn is_alive(&mut self) -> bool {
        if self.socket.send(to_message(&Frame::probe())).await.is_err() {
            return false;
        }

        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(_))) => return true,
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(_)) => return false,
            }
        }
    }

    /// Invoke an endpoint on the session's target and await the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TransportClosed`] when the session breaks
    /// during the request and the one permitted retry fails too.
    pub async fn request(&mut self, endpoint: &str, kwargs: Value) -> Result<Value, ClientError> {
        self.request_with(endpoint, true, kwargs).await
    }

    /// Like [`request`], with explicit control over whether the broker
    /// waits for completion before replying.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`request`].
    ///
    /// [`request`]: Self::request
    pub async fn request_with(
        &mut self,
        endpoint: &str,
        wait_finish: bool,
        kwargs: Value,
    ) -> Result<Value, ClientError> {
        tracing::debug!("sending request to {endpoint:?} with {kwargs:?}");

        match self.perform(endpoint, wait_finish, kwargs.clone()).await {
            Ok(reply) => Ok(reply),
            Err(source) => {
                tracing::error!(
                    "request transport failed, retrying in {RETRY_DELAY:?}: {source}",
                );
                time::sleep(RETRY_DELAY).await;

                self.perform(endpoint, wait_finish, kwargs).await
            }
        }
    }

    async fn perform(
        &mut self,
        endpoint: &str,
        wait_finish: bool,
        kwargs: Value,
    ) -> Result<Value, ClientError> {
        let frame = Frame::request(endpoint, wait_finish, kwargs);
        self.socket
            .send(to_message(&frame))
            .await
            .map_err(|source| ClientError::Sending { source })?;

        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply = serde_json::from_str::<Value>(&text)
                        .map_err(|source| ClientError::Deserializing { source })?;

                    if let Some(code) = reply.get("code").and_then(Value::as_i64) {
                        if code != 200 {
                            tracing::warn!("received code {code} instead of the usual 200");
                        }
                    }

                    return Ok(reply);
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::TransportClosed),
                Some(Ok(_)) => {}
                Some(Err(_)) => return Err(ClientError::TransportClosed),
            }
        }
    }

    /// Close the session.
    pub async fn close(mut self) {
        let _res = self.socket.close(None).await;
    }
}

fn connect_request(
    address: SocketAddr,
    bot_id: u64,
    identifier: &str,
    secret_key: Option<&str>,
) -> Result<Request<()>, ClientError> {
    let mut builder = Request::get(format!("ws://{address}"));
    builder = builder.header("Endpoints", "create_request");
    builder = builder.header("Bot-ID", bot_id);
    builder = builder.header("Identifier", identifier);

    if let Some(secret_key) = secret_key {
        builder = builder.header("Secret-Key", secret_key);
    }

    builder
        .body(())
        .map_err(|source| ClientError::BuildingConnectionRequest { source })
}

fn to_message(frame: &Frame) -> Message {
    Message::Text(serde_json::to_string(frame).expect("frame serialization never fails"))
}

#[cfg(test)]
mod tests {
    use super::{Client, ClientError, Session};
    use static_assertions::{assert_fields, assert_impl_all};
    use std::{error::Error, fmt::Debug};

    assert_fields!(ClientError::Connecting: source);
    assert_impl_all!(ClientError: Debug, Error, Send, Sync);
    assert_impl_all!(Client: Clone, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(Session: Debug, Send);

    #[test]
    fn connect_request_headers() {
        let request = super::connect_request(
            std::net::SocketAddr::from(([127, 0, 0, 1], 20000)),
            42,
            "all",
            Some("s"),
        )
        .unwrap();

        assert_eq!(request.headers()["Endpoints"], "create_request");
        assert_eq!(request.headers()["Bot-ID"], "42");
        assert_eq!(request.headers()["Identifier"], "all");
        assert_eq!(request.headers()["Secret-Key"], "s");
    }
}

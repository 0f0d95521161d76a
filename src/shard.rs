//! The worker side of the bus: a shard serving named endpoints.
//!
//! A [`Shard`] maintains one long-lived connection to the broker under a
//! `(bot_id, identifier)` identity and a catalog of async handlers. Incoming
//! requests each run in their own task so a slow handler never blocks the
//! receive loop; responses travel back over the same connection, paired to
//! their request by the broker-issued correlation UUID.
//!
//! When the connection drops the shard keeps retrying every 3 seconds,
//! re-registering with an empty endpoint list so the broker recovers the
//! catalog it persisted for the identity.

use crate::model::{broker::Dispatch, worker::Frame};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::{Error as HttpError, Request};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_tungstenite::{
    tungstenite::{Error as TungsteniteError, Message},
    MaybeTlsStream, WebSocketStream,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Boxed error an endpoint handler may fail with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// An error occurred while connecting a shard or driving its session.
#[derive(Debug)]
#[non_exhaustive]
pub enum ShardError {
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
    /// The broker answered the registration with a non-success reply.
    Rejected {
        /// The broker's reply message.
        message: String,
    },
    /// The connection ended while waiting for the registration reply.
    ConnectionClosed,
    /// The shard isn't connected.
    NotConnected,
}

impl Display for ShardError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::BuildingConnectionRequest { .. } => {
                f.write_str("failed to build connection request")
            }
            Self::Connecting { .. } => f.write_str("failed to connect to the cluster"),
            Self::Rejected { message } => {
                f.write_str("the cluster rejected the registration: ")?;

                f.write_str(message)
            }
            Self::ConnectionClosed => {
                f.write_str("the connection closed during the registration")
            }
            Self::NotConnected => f.write_str("the shard is not connected"),
        }
    }
}

impl Error for ShardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BuildingConnectionRequest { source } => Some(source),
            Self::Connecting { source } => Some(source),
            Self::Rejected { .. } | Self::ConnectionClosed | Self::NotConnected => None,
        }
    }
}

/// The configuration a [`Shard`] uses to connect to the broker.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ShardConfig {
    /// The address of the broker.
    pub address: SocketAddr,
    /// ID of the bot the shard belongs to.
    pub bot_id: u64,
    /// Identifier of the shard within the bot.
    pub identifier: String,
    /// The secret to present when authenticating.
    pub secret_key: Option<String>,
}

impl ShardConfig {
    /// Create a new configuration for connecting a shard.
    pub fn new(
        address: SocketAddr,
        bot_id: u64,
        identifier: impl Into<String>,
        secret_key: impl Into<Option<String>>,
    ) -> Self {
        Self {
            address,
            bot_id,
            identifier: identifier.into(),
            secret_key: secret_key.into(),
        }
    }
}

struct ShardRef {
    closed: AtomicBool,
    config: ShardConfig,
    connected: AtomicBool,
    handlers: RwLock<HashMap<String, Handler>>,
    session: Mutex<Option<UnboundedSender<Message>>>,
}

impl Debug for ShardRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ShardRef")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

/// A worker process's connection to the cluster, serving named endpoints for
/// one `(bot_id, identifier)` identity.
///
/// # Cloning
///
/// The shard internally wraps its data within an Arc, so it can be cloned
/// and passed around tasks cheaply.
#[derive(Clone, Debug)]
pub struct Shard(Arc<ShardRef>);

impl Shard {
    /// Create a new, unconnected shard.
    pub fn new(config: ShardConfig) -> Self {
        Self(Arc::new(ShardRef {
            closed: AtomicBool::new(false),
            config,
            connected: AtomicBool::new(false),
            handlers: RwLock::new(HashMap::new()),
            session: Mutex::new(None),
        }))
    }

    /// Return an immutable reference to the shard's configuration.
    pub fn config(&self) -> &ShardConfig {
        &self.0.config
    }

    /// Whether the shard currently holds a registered connection.
    pub fn connected(&self) -> bool {
        self.0.connected.load(Ordering::Acquire)
    }

    /// Register an async handler for a named endpoint.
    ///
    /// The handler receives the request's `data` object and returns the
    /// response object. A failing handler, or one returning a non-object
    /// value, is answered for with a code-500 error response.
    pub fn endpoint<F, Fut>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.0
            .handlers
            .write()
            .expect("handlers poisoned")
            .insert(name.into(), Arc::new(move |data| Box::pin(handler(data))));

        self
    }

    /// Connect to the cluster and register every endpoint added via
    /// [`endpoint`].
    ///
    /// On failure the error is logged and the method returns; a shard that
    /// was connected before keeps reconnecting on its own, so connect
    /// failures are not surfaced as errors.
    ///
    /// [`endpoint`]: Self::endpoint
    pub async fn connect(&self) {
        self.0.closed.store(false, Ordering::Release);

        let endpoints: Vec<String> = self
            .0
            .handlers
            .read()
            .expect("handlers poisoned")
            .keys()
            .cloned()
            .collect();

        match self.establish(endpoints).await {
            Ok(()) => tracing::info!("successfully connected to the cluster"),
            Err(source) => tracing::error!("failed to connect to the cluster: {source}"),
        }
    }

    /// Close the shard's connection.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::NotConnected`] when the shard holds no
    /// connection.
    pub fn disconnect(&self) -> Result<(), ShardError> {
        self.0.closed.store(true, Ordering::Release);

        let session = self.0.session.lock().expect("session poisoned").clone();

        match session {
            Some(tx) => {
                let _res = tx.send(Message::Close(None));

                Ok(())
            }
            None => Err(ShardError::NotConnected),
        }
    }

    /// Deregister the shard from the broker, deleting its persisted endpoint
    /// catalog, then close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::NotConnected`] when the shard holds no
    /// connection.
    pub fn deregister(&self) -> Result<(), ShardError> {
        self.0.closed.store(true, Ordering::Release);

        let session = self.0.session.lock().expect("session poisoned").clone();

        match session {
            Some(tx) => {
                let _res = tx.send(to_message(&Frame::DisconnectShard));

                Ok(())
            }
            None => Err(ShardError::NotConnected),
        }
    }

    /// Open a connection, register with the given endpoint list, and start
    /// the session task.
    fn establish(
        &self,
        endpoints: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ShardError>> + Send + '_>> {
        Box::pin(async move {
            let request = connect_request(&self.0.config)?;

            let (stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|source| ShardError::Connecting { source })?;
            let (mut sink, mut reader) = stream.split();

            let init = Frame::initialize(endpoints, self.0.config.bot_id);
            sink.send(to_message(&init))
                .await
                .map_err(|source| ShardError::Connecting { source })?;

            let reply = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        break serde_json::from_str::<Value>(&text).unwrap_or_default()
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(ShardError::ConnectionClosed),
                    Some(Ok(_)) => {}
                    Some(Err(source)) => return Err(ShardError::Connecting { source }),
                }
            };

            if reply.get("code").and_then(Value::as_u64) != Some(200) {
                return Err(ShardError::Rejected {
                    message: reply
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown reason")
                        .to_owned(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.0.session.lock().expect("session poisoned") = Some(tx);
            self.0.connected.store(true, Ordering::Release);

            let shard = self.clone();
            tokio::spawn(async move {
                shard.run(sink, reader, rx).await;
            });

            Ok(())
        })
    }

    /// Drive the session: forward queued responses out and spawn a handler
    /// task per incoming request.
    fn run(
        self,
        mut sink: SplitSink<Socket, Message>,
        mut reader: SplitStream<Socket>,
        mut rx: UnboundedReceiver<Message>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));

                            if sink.send(message).await.is_err() {
                                break;
                            }

                            if closing {
                                break;
                            }
                        }
                        None => {
                            let _res = sink.send(Message::Close(None)).await;

                            break;
                        }
                    },
                    incoming = reader.next() => match incoming {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Ping(data))) => {
                            let _res = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(source)) => {
                            tracing::debug!("connection to the cluster errored: {source}");

                            break;
                        }
                    },
                }
            }

            self.0.connected.store(false, Ordering::Release);
            *self.0.session.lock().expect("session poisoned") = None;

            if !self.0.closed.load(Ordering::Acquire) {
                tracing::warn!("connection to the cluster lost, reconnecting");

                tokio::spawn(async move {
                    self.reconnect().await;
                });
            }
        })
    }

    /// Spawn a task invoking the handler for one dispatched request.
    fn dispatch(&self, text: &str) {
        let dispatch = match serde_json::from_str::<Dispatch>(text) {
            Ok(dispatch) => dispatch,
            Err(_) => {
                tracing::warn!("unknown message from the cluster: {text}");

                return;
            }
        };

        tracing::debug!("received request: {dispatch:?}");

        let handler = self
            .0
            .handlers
            .read()
            .expect("handlers poisoned")
            .get(&dispatch.endpoint)
            .cloned();

        let shard = self.clone();
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(dispatch.data).await,
                None => Err(HandlerError::from(format!(
                    "no handler registered for endpoint {:?}",
                    dispatch.endpoint
                ))),
            };

            let response = normalize_response(result, &dispatch.endpoint);
            tracing::debug!("sending response: {response:?}");

            let frame = Frame::response(dispatch.uuid, response, shard.0.config.identifier.clone());
            let session = shard.0.session.lock().expect("session poisoned").clone();

            match session {
                Some(tx) => {
                    let _res = tx.send(to_message(&frame));
                }
                None => tracing::debug!("dropping response {}: not connected", dispatch.uuid),
            }
        });
    }

    /// Retry connecting every 3 seconds until the shard is connected or has
    /// been explicitly closed.
    ///
    /// Reconnection registers with an empty endpoint list, relying on the
    /// catalog the broker persisted for this identity.
    fn reconnect(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                if self.0.closed.load(Ordering::Acquire) || self.connected() {
                    break;
                }

                match self.establish(Vec::new()).await {
                    Ok(()) => {
                        tracing::info!("successfully reconnected to the cluster");

                        break;
                    }
                    Err(source) => {
                        tracing::warn!("reconnect attempt failed: {source}");
                    }
                }

                time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}

/// Insert the implicit success code and replace invalid handler outcomes
/// with error responses.
fn normalize_response(result: Result<Value, HandlerError>, endpoint: &str) -> Value {
    match result {
        Ok(Value::Object(mut map)) => {
            if !map.contains_key("code") {
                map.insert("code".to_owned(), Value::from(200));
            }

            Value::Object(map)
        }
        Ok(Value::Null) => json!({ "code": 200 }),
        Ok(other) => json!({
            "error": format!(
                "Expected type `Dict` as response, got '{}' instead!",
                json_type_name(&other),
            ),
            "code": 500,
        }),
        Err(source) => {
            tracing::error!("error while calling {endpoint:?}: {source}");

            json!({
                "error": "Something went wrong while calling the route!",
                "code": 500,
            })
        }
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn connect_request(config: &ShardConfig) -> Result<Request<()>, ShardError> {
    let mut builder = Request::get(format!("ws://{}", config.address));
    builder = builder.header("Bot-ID", config.bot_id);
    builder = builder.header("Identifier", &config.identifier);

    if let Some(secret_key) = &config.secret_key {
        builder = builder.header("Secret-Key", secret_key);
    }

    builder
        .body(())
        .map_err(|source| ShardError::BuildingConnectionRequest { source })
}

fn to_message(frame: &Frame) -> Message {
    Message::Text(serde_json::to_string(frame).expect("frame serialization never fails"))
}

#[cfg(test)]
mod tests {
    use super::{normalize_response, HandlerError, Shard, ShardConfig, ShardError};
    use serde_json::{json, Value};
    use static_assertions::{assert_fields, assert_impl_all};
    use std::{error::Error, fmt::Debug};

    assert_fields!(ShardConfig: address, bot_id, identifier, secret_key);
    assert_impl_all!(ShardConfig: Clone, Debug, Eq, PartialEq, Send, Sync);
    assert_fields!(ShardError::Connecting: source);
    assert_impl_all!(ShardError: Debug, Error, Send, Sync);
    assert_impl_all!(Shard: Clone, Debug, Send, Sync);

    #[test]
    fn missing_code_is_inserted() {
        let normalized = normalize_response(Ok(json!({ "pong": true })), "ping");

        assert_eq!(normalized, json!({ "pong": true, "code": 200 }));
    }

    #[test]
    fn explicit_code_is_kept() {
        let normalized = normalize_response(Ok(json!({ "code": 403 })), "ping");

        assert_eq!(normalized, json!({ "code": 403 }));
    }

    #[test]
    fn null_becomes_empty_success() {
        let normalized = normalize_response(Ok(Value::Null), "ping");

        assert_eq!(normalized, json!({ "code": 200 }));
    }

    #[test]
    fn non_object_is_rejected() {
        let normalized = normalize_response(Ok(json!([1, 2])), "ping");

        assert_eq!(
            normalized,
            json!({
                "error": "Expected type `Dict` as response, got 'Array' instead!",
                "code": 500,
            }),
        );
    }

    #[test]
    fn handler_failure_is_masked() {
        let normalized = normalize_response(Err(HandlerError::from("boom")), "ping");

        assert_eq!(
            normalized,
            json!({
                "error": "Something went wrong while calling the route!",
                "code": 500,
            }),
        );
    }

    #[test]
    fn disconnect_without_connection_fails() {
        let config = ShardConfig::new(
            std::net::SocketAddr::from(([127, 0, 0, 1], 20000)),
            42,
            "1",
            None,
        );
        let shard = Shard::new(config);

        assert!(matches!(
            shard.disconnect(),
            Err(ShardError::NotConnected)
        ));
    }
}

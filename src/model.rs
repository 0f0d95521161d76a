//! Models to (de)serialize the text frames exchanged between workers, the
//! broker, and requesters.
//!
//! Every frame is a UTF-8 JSON object. Frames that carry an operation are
//! discriminated by the literal `endpoint_choosen` key; the requester's
//! liveness probe is the one frame without it. Receivers ignore unknown
//! fields.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Operation discriminator carried in the `endpoint_choosen` field of a
/// frame.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// A requester asks the broker to invoke an endpoint.
    CreateRequest,
    /// A worker explicitly deregisters its shard.
    DisconnectShard,
    /// A worker declares its identity and endpoint catalog.
    InitializeShard,
    /// A worker returns the response for a dispatched request.
    ReturnResponse,
}

/// Identity of a shard: the `(bot_id, identifier)` pair under which a worker
/// registers with the broker.
///
/// Both components travel as header strings; the literal identifier `all` is
/// reserved for requester fan-out and never names a registered shard.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ShardId {
    /// ID of the bot the shard belongs to.
    pub bot_id: String,
    /// Identifier of the shard within the bot.
    pub identifier: String,
}

impl ShardId {
    /// Create a new shard identity from its two components.
    pub fn new(bot_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            identifier: identifier.into(),
        }
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.bot_id)?;
        f.write_str("/")?;

        f.write_str(&self.identifier)
    }
}

pub mod worker {
    //! Frames sent by workers to the broker.

    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use uuid::Uuid;

    /// Declaration a worker makes when registering its shard.
    #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct ShardInit {
        /// Names of the endpoints the shard serves.
        ///
        /// An empty list asks the broker to recover the previously persisted
        /// catalog for this identity.
        pub endpoints: Vec<String>,
        /// The bot user ID of the connecting worker.
        pub client_id: u64,
    }

    /// A frame travelling from a worker to the broker.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[non_exhaustive]
    #[serde(tag = "endpoint_choosen", rename_all = "snake_case")]
    pub enum Frame {
        /// Register the shard and declare (or recover) its endpoints.
        InitializeShard {
            /// The registration payload.
            response: ShardInit,
        },
        /// Return the response for a previously dispatched request.
        ReturnResponse {
            /// Correlation ID the request was dispatched with.
            uuid: Uuid,
            /// The handler's response object, delivered verbatim.
            response: Value,
            /// Identifier of the responding shard.
            #[serde(default, skip_serializing_if = "Option::is_none")]
            identifier: Option<String>,
        },
        /// Deregister the shard and delete its persisted catalog.
        DisconnectShard,
    }

    impl Frame {
        /// Create an `initialize_shard` frame.
        pub const fn initialize(endpoints: Vec<String>, client_id: u64) -> Self {
            Self::InitializeShard {
                response: ShardInit {
                    endpoints,
                    client_id,
                },
            }
        }

        /// Create a `return_response` frame for a dispatched request.
        pub fn response(uuid: Uuid, response: Value, identifier: impl Into<String>) -> Self {
            Self::ReturnResponse {
                uuid,
                response,
                identifier: Some(identifier.into()),
            }
        }
    }
}

pub mod requester {
    //! Frames sent by requesters to the broker.

    use super::Opcode;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// Arguments of an endpoint invocation.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct RequestArgs {
        /// Name of the endpoint to invoke.
        pub endpoint: String,
        /// Whether the requester suspends until every targeted shard has
        /// responded.
        #[serde(default)]
        pub wait_finish: bool,
        /// Keyword arguments forwarded to the handler.
        #[serde(default)]
        pub kwargs: Value,
    }

    /// A frame travelling from a requester to the broker.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[non_exhaustive]
    #[serde(untagged)]
    pub enum Frame {
        /// Liveness probe; answered without touching any broker state.
        ConnectionTest {
            /// Always `true`.
            connection_test: bool,
        },
        /// Ask the broker to invoke an endpoint on the session's target.
        CreateRequest {
            /// Always [`Opcode::CreateRequest`].
            endpoint_choosen: Opcode,
            /// The invocation arguments.
            response: RequestArgs,
        },
    }

    impl Frame {
        /// Create a liveness probe frame.
        pub const fn probe() -> Self {
            Self::ConnectionTest {
                connection_test: true,
            }
        }

        /// Create a `create_request` frame.
        pub fn request(endpoint: impl Into<String>, wait_finish: bool, kwargs: Value) -> Self {
            Self::CreateRequest {
                endpoint_choosen: Opcode::CreateRequest,
                response: RequestArgs {
                    endpoint: endpoint.into(),
                    wait_finish,
                    kwargs,
                },
            }
        }
    }
}

pub mod broker {
    //! Frames emitted by the broker.

    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use uuid::Uuid;

    /// A request dispatched by the broker to a worker.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct Dispatch {
        /// Name of the endpoint to invoke.
        pub endpoint: String,
        /// The requester's keyword arguments.
        pub data: Value,
        /// Correlation ID to echo in the `return_response` frame.
        pub uuid: Uuid,
        /// Identifier of the shard the request is addressed to.
        pub identifier: String,
    }

    impl Dispatch {
        /// Create a new dispatch frame.
        pub const fn new(endpoint: String, data: Value, uuid: Uuid, identifier: String) -> Self {
            Self {
                endpoint,
                data,
                uuid,
                identifier,
            }
        }
    }

    /// A control reply with a message and a status code.
    #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct Reply {
        /// Human-readable outcome description.
        pub message: String,
        /// Status code; `200` on success.
        pub code: u16,
    }

    impl Reply {
        /// Create a reply from a message and a code.
        pub fn new(message: impl Into<String>, code: u16) -> Self {
            Self {
                message: message.into(),
                code,
            }
        }

        /// Successful shard registration.
        pub fn connected() -> Self {
            Self::new("Successfuly connected to the cluster!", 200)
        }

        /// Successful liveness probe.
        pub fn connection_test() -> Self {
            Self::new("Successful connection", 200)
        }

        /// The `Secret-Key` header did not match the configured secret.
        pub fn invalid_secret() -> Self {
            Self::new("Invalid secret key!", 403)
        }

        /// The `Bot-ID` header is missing or empty.
        pub fn missing_bot_id() -> Self {
            Self::new("Missing bot ID!", 500)
        }

        /// The `Identifier` header is missing or empty.
        pub fn missing_identifier() -> Self {
            Self::new("Missing identifier!", 500)
        }

        /// The frame could not be parsed or carries an unknown operation.
        pub fn unknown_frame() -> Self {
            Self::new("Endpoint unknown", 500)
        }

        /// A shard with the given identifier is already registered.
        pub fn duplicate_shard(identifier: &str) -> Self {
            Self::new(
                format!("Shard with ID '{identifier}' already exists!"),
                500,
            )
        }

        /// No shard of the given bot is registered.
        pub fn unknown_bot(bot_id: &str) -> Self {
            Self::new(format!("Bot with ID '{bot_id}' doesn't exists!"), 404)
        }

        /// The bot is known but the given shard is not registered.
        pub fn unknown_shard(identifier: &str) -> Self {
            Self::new(
                format!("Shard with ID '{identifier}' doesn't exists!"),
                404,
            )
        }

        /// A shard initialized with an empty endpoint list but no catalog
        /// entry is persisted for it.
        pub fn missing_endpoints(identifier: &str) -> Self {
            Self::new(
                format!("No stored endpoints for shard '{identifier}'!"),
                500,
            )
        }

        /// Persisting a shard's declared endpoints failed.
        pub fn catalog_write_failed(identifier: &str) -> Self {
            Self::new(
                format!("Failed to store endpoints for shard '{identifier}'!"),
                500,
            )
        }
    }

    /// Reply for a request naming an endpoint the target shard does not
    /// serve.
    ///
    /// This reply predates the `code` convention and carries its status
    /// under the literal `"404"` key instead.
    #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct UnknownEndpoint {
        /// Always `"Unknown endpoint!"`.
        pub message: String,
        /// Always `404`.
        #[serde(rename = "404")]
        pub not_found: u16,
    }

    impl UnknownEndpoint {
        /// Create the unknown-endpoint reply.
        pub fn new() -> Self {
            Self {
                message: "Unknown endpoint!".to_owned(),
                not_found: 404,
            }
        }
    }

    impl Default for UnknownEndpoint {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Reply settling a fan-out request.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[non_exhaustive]
    pub struct FanoutReply {
        /// Status code; always `200`.
        pub code: u16,
        /// Human-readable outcome description.
        pub message: String,
        /// Responses keyed by shard identifier, present only when the
        /// requester waited for completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub data: Option<Map<String, Value>>,
    }

    impl FanoutReply {
        /// Aggregated reply for a fan-out that waited for every member.
        pub fn finished(data: Map<String, Value>) -> Self {
            Self {
                code: 200,
                message: "The requests have been made.".to_owned(),
                data: Some(data),
            }
        }

        /// Acknowledgment for a fire-and-forget fan-out.
        pub fn sent() -> Self {
            Self {
                code: 200,
                message: "The requests were sent.".to_owned(),
                data: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        broker::{Dispatch, FanoutReply, Reply, UnknownEndpoint},
        requester,
        worker::{self, ShardInit},
        Opcode, ShardId,
    };
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;
    use uuid::Uuid;

    assert_impl_all!(Dispatch: Clone, Debug, Deserialize<'static>, PartialEq, Serialize);
    assert_impl_all!(FanoutReply: Clone, Debug, Deserialize<'static>, PartialEq, Serialize);
    assert_impl_all!(Opcode: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(Reply: Clone, Debug, Deserialize<'static>, Eq, PartialEq, Serialize);
    assert_impl_all!(ShardId: Clone, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(ShardInit: Clone, Debug, Deserialize<'static>, Eq, PartialEq, Serialize);
    assert_impl_all!(requester::Frame: Clone, Debug, Deserialize<'static>, PartialEq, Serialize);
    assert_impl_all!(worker::Frame: Clone, Debug, Deserialize<'static>, PartialEq, Serialize);

    #[test]
    fn initialize_shard_discriminator() {
        let frame = worker::Frame::initialize(vec!["ping".to_owned()], 42);
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["endpoint_choosen"], "initialize_shard");
        assert_eq!(value["response"]["endpoints"], json!(["ping"]));
        assert_eq!(value["response"]["client_id"], 42);
    }

    #[test]
    fn return_response_roundtrip() {
        let uuid = Uuid::new_v4();
        let raw = format!(
            r#"{{"endpoint_choosen": "return_response", "uuid": "{uuid}", "response": {{"pong": true, "code": 200}}}}"#
        );

        let frame: worker::Frame = serde_json::from_str(&raw).unwrap();

        match frame {
            worker::Frame::ReturnResponse {
                uuid: parsed,
                response,
                identifier,
            } => {
                assert_eq!(parsed, uuid);
                assert_eq!(response["pong"], Value::Bool(true));
                assert!(identifier.is_none());
            }
            other => panic!("parsed wrong frame: {other:?}"),
        }
    }

    #[test]
    fn disconnect_shard_is_bare() {
        let frame: worker::Frame =
            serde_json::from_str(r#"{"endpoint_choosen": "disconnect_shard"}"#).unwrap();

        assert_eq!(frame, worker::Frame::DisconnectShard);
    }

    #[test]
    fn probe_classification() {
        let frame: requester::Frame = serde_json::from_str(r#"{"connection_test": true}"#).unwrap();

        assert_eq!(frame, requester::Frame::probe());
    }

    #[test]
    fn create_request_defaults() {
        let raw = r#"{"endpoint_choosen": "create_request", "response": {"endpoint": "ping"}}"#;
        let frame: requester::Frame = serde_json::from_str(raw).unwrap();

        match frame {
            requester::Frame::CreateRequest { response, .. } => {
                assert_eq!(response.endpoint, "ping");
                assert!(!response.wait_finish);
                assert_eq!(response.kwargs, Value::Null);
            }
            other => panic!("parsed wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_endpoint_key_is_literal() {
        let value = serde_json::to_value(UnknownEndpoint::new()).unwrap();

        assert_eq!(value["message"], "Unknown endpoint!");
        assert_eq!(value["404"], 404);
        assert!(value.get("code").is_none());
    }

    #[test]
    fn fanout_ack_has_no_data() {
        let value = serde_json::to_value(FanoutReply::sent()).unwrap();

        assert_eq!(value["message"], "The requests were sent.");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn dispatch_field_names() {
        let uuid = Uuid::new_v4();
        let dispatch = Dispatch::new(
            "stats".to_owned(),
            json!({"detailed": true}),
            uuid,
            "1".to_owned(),
        );
        let value = serde_json::to_value(&dispatch).unwrap();

        assert_eq!(value["endpoint"], "stats");
        assert_eq!(value["data"]["detailed"], Value::Bool(true));
        assert_eq!(value["uuid"], uuid.to_string());
        assert_eq!(value["identifier"], "1");
    }

    #[test]
    fn reply_messages() {
        assert_eq!(
            Reply::connected().message,
            "Successfuly connected to the cluster!"
        );
        assert_eq!(
            Reply::duplicate_shard("1").message,
            "Shard with ID '1' already exists!"
        );
        assert_eq!(Reply::unknown_shard("9").code, 404);
        assert_eq!(Reply::invalid_secret().code, 403);
    }

    #[test]
    fn shard_id_display() {
        assert_eq!(ShardId::new("42", "1").to_string(), "42/1");
    }
}

//! Per-connection handshake, read loop, and frame routing.

use super::{
    state::{ConnectionId, FanoutJob, ShardRegistration, Waiter},
    Broker,
};
use crate::model::{
    broker::{Dispatch, FanoutReply, Reply, UnknownEndpoint},
    requester::{self, RequestArgs},
    worker::{self, ShardInit},
    ShardId,
};
use dashmap::mapref::entry::Entry;
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedSender},
};
use tokio_tungstenite::{
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
    WebSocketStream,
};
use uuid::Uuid;

type Reader = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Default)]
struct Headers {
    secret_key: Option<String>,
    bot_id: Option<String>,
    identifier: Option<String>,
    requester: bool,
}

impl Headers {
    fn capture(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            secret_key: header("Secret-Key"),
            bot_id: header("Bot-ID").filter(|value| !value.is_empty()),
            identifier: header("Identifier").filter(|value| !value.is_empty()),
            requester: header("Endpoints").map_or(false, |value| value == "create_request"),
        }
    }
}

/// Drive one accepted connection from handshake to teardown.
pub(super) async fn handle(broker: Broker, stream: TcpStream) {
    let mut headers = Headers::default();

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        headers = Headers::capture(request);

        Ok(response)
    };

    let stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(stream) => stream,
        Err(source) => {
            tracing::debug!("websocket handshake failed: {source}");

            return;
        }
    };

    let (mut sink, mut reader) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Sole writer for this socket. Every task that wants to send into the
    // connection goes through the channel, so writes stay serialized.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));

            if sink.send(message).await.is_err() {
                break;
            }

            if closing {
                break;
            }
        }
    });

    if !secret_ok(broker.secret_key(), headers.secret_key.as_deref()) {
        tracing::warn!("rejecting connection with an invalid secret");
        send_frame(&tx, &Reply::invalid_secret());
        close(&tx);

        return;
    }

    let bot_id = match headers.bot_id {
        Some(bot_id) => bot_id,
        None => {
            send_frame(&tx, &Reply::missing_bot_id());
            close(&tx);

            return;
        }
    };

    let identifier = match headers.identifier {
        Some(identifier) => identifier,
        None => {
            send_frame(&tx, &Reply::missing_identifier());
            close(&tx);

            return;
        }
    };

    let connection = broker.state().add_connection(tx.clone());
    tracing::debug!("connection {connection} open for {bot_id}/{identifier}");

    if headers.requester {
        requester_session(&broker, connection, &bot_id, &identifier, &mut reader, &tx).await;
    } else {
        worker_session(&broker, connection, &bot_id, &identifier, &mut reader, &tx).await;
    }

    broker.state().remove_connection(connection);
    tracing::debug!("connection {connection} closed");
}

/// Read frames until the peer goes away, answering pings in place.
async fn next_frame(reader: &mut Reader, tx: &UnboundedSender<Message>) -> Option<String> {
    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(message) => message,
            Err(source) => {
                tracing::debug!("connection errored: {source}");

                return None;
            }
        };

        match message {
            Message::Text(text) => return Some(text),
            Message::Ping(data) => {
                let _res = tx.send(Message::Pong(data));
            }
            Message::Close(_) => return None,
            other => {
                tracing::debug!("ignoring non-text message: {other:?}");
            }
        }
    }

    None
}

async fn worker_session(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    identifier: &str,
    reader: &mut Reader,
    tx: &UnboundedSender<Message>,
) {
    while let Some(text) = next_frame(reader, tx).await {
        let frame = match serde_json::from_str::<worker::Frame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                tracing::warn!("unknown frame from worker {bot_id}/{identifier}: {text}");
                send_frame(tx, &Reply::unknown_frame());
                close(tx);

                break;
            }
        };

        match frame {
            worker::Frame::InitializeShard { response } => {
                if !initialize_shard(broker, connection, bot_id, identifier, response, tx).await {
                    break;
                }
            }
            worker::Frame::ReturnResponse {
                uuid,
                response,
                identifier: responder,
            } => return_response(broker, uuid, response, responder),
            worker::Frame::DisconnectShard => {
                disconnect_shard(broker, connection, bot_id, identifier).await;
                close(tx);

                break;
            }
        }
    }
}

/// Register the shard, recovering or overwriting its persisted endpoint
/// catalog. Returns whether the session continues.
async fn initialize_shard(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    identifier: &str,
    init: ShardInit,
    tx: &UnboundedSender<Message>,
) -> bool {
    let id = ShardId::new(bot_id, identifier);

    if broker.state().shards.contains_key(&id) {
        tracing::warn!("rejecting duplicate registration for {id}");
        send_frame(tx, &Reply::duplicate_shard(identifier));
        close(tx);

        return false;
    }

    let endpoints = if init.endpoints.is_empty() {
        match broker.catalog().load(&id).await {
            Ok(endpoints) => endpoints,
            Err(source) => {
                tracing::warn!("no recoverable endpoints for {id}: {source}");
                send_frame(tx, &Reply::missing_endpoints(identifier));
                close(tx);

                return false;
            }
        }
    } else {
        if let Err(source) = broker.catalog().store(&id, &init.endpoints).await {
            tracing::error!("failed to persist endpoints for {id}: {source}");
            send_frame(tx, &Reply::catalog_write_failed(identifier));
            close(tx);

            return false;
        }

        init.endpoints
    };

    match broker.state().shards.entry(id) {
        Entry::Occupied(_) => {
            // Lost a registration race while touching the catalog.
            send_frame(tx, &Reply::duplicate_shard(identifier));
            close(tx);

            false
        }
        Entry::Vacant(entry) => {
            entry.insert(ShardRegistration {
                connection,
                client_id: init.client_id,
                endpoints: endpoints.into_iter().collect(),
            });

            tracing::info!("shard {bot_id}/{identifier} registered");
            send_frame(tx, &Reply::connected());

            true
        }
    }
}

/// Correlate a worker's response to its waiter.
fn return_response(broker: &Broker, uuid: Uuid, response: Value, responder: Option<String>) {
    let waiter = match broker.state().waiters.remove(&uuid) {
        Some((_, waiter)) => waiter,
        None => {
            tracing::warn!("dropping response for unknown request {uuid}");

            return;
        }
    };

    match waiter {
        Waiter::Unicast { requester } => {
            tracing::debug!("forwarding response {uuid} to connection {requester}");

            if !broker
                .state()
                .send(requester, Message::Text(response.to_string()))
            {
                tracing::debug!("requester for {uuid} is gone");
            }
        }
        Waiter::FanoutMember { job, identifier } => {
            let key = responder.unwrap_or(identifier);
            let mut finished = false;

            if let Some(mut entry) = broker.state().fanouts.get_mut(&job) {
                if entry.wait_finish {
                    entry
                        .results
                        .insert(key, serde_json::json!({ "response": response }));
                    finished = entry.results.len() >= entry.expected;
                }
            } else {
                tracing::debug!("dropping response {uuid} for settled fan-out {job}");
            }

            if finished {
                settle_fanout(broker, job);
            }
        }
    }
}

/// Remove a settled fan-out job and deliver its aggregated reply.
fn settle_fanout(broker: &Broker, job: Uuid) {
    let job_state = match broker.state().fanouts.remove(&job) {
        Some((_, job_state)) => job_state,
        None => return,
    };

    tracing::debug!(
        "fan-out {job} settled with {} responses",
        job_state.results.len(),
    );

    let requester = job_state.requester;
    if !broker
        .state()
        .send(requester, to_message(&FanoutReply::finished(job_state.results)))
    {
        tracing::debug!("requester for fan-out {job} is gone");
    }
}

/// Deregister the shard if this connection serves it and delete its
/// persisted catalog entry.
async fn disconnect_shard(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    identifier: &str,
) {
    let id = ShardId::new(bot_id, identifier);

    let registered = broker
        .state()
        .shards
        .get(&id)
        .map_or(false, |registration| registration.connection == connection);

    if registered {
        broker.state().shards.remove(&id);
        broker.catalog().remove(&id).await;
        tracing::info!("shard {id} deregistered");
    }
}

async fn requester_session(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    identifier: &str,
    reader: &mut Reader,
    tx: &UnboundedSender<Message>,
) {
    while let Some(text) = next_frame(reader, tx).await {
        let frame = match serde_json::from_str::<requester::Frame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                tracing::warn!("unknown frame from requester {bot_id}/{identifier}: {text}");
                send_frame(tx, &Reply::unknown_frame());
                close(tx);

                break;
            }
        };

        match frame {
            requester::Frame::ConnectionTest { .. } => {
                send_frame(tx, &Reply::connection_test());
            }
            requester::Frame::CreateRequest { response, .. } => {
                let proceed = if identifier == "all" {
                    create_request_all(broker, connection, bot_id, response, tx)
                } else {
                    create_request(broker, connection, bot_id, identifier, response, tx)
                };

                if !proceed {
                    break;
                }
            }
        }
    }
}

/// Dispatch a unicast request to its target shard. Returns whether the
/// session continues.
fn create_request(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    identifier: &str,
    args: RequestArgs,
    tx: &UnboundedSender<Message>,
) -> bool {
    let id = ShardId::new(bot_id, identifier);

    let worker_connection = match broker.state().shards.get(&id) {
        Some(registration) if registration.endpoints.contains(&args.endpoint) => {
            registration.connection
        }
        Some(_) => {
            send_frame(tx, &UnknownEndpoint::new());
            close(tx);

            return false;
        }
        None => {
            let outcome = if broker.state().bot_registered(bot_id) {
                Reply::unknown_shard(identifier)
            } else {
                Reply::unknown_bot(bot_id)
            };
            send_frame(tx, &outcome);
            close(tx);

            return false;
        }
    };

    let uuid = Uuid::new_v4();
    broker.state().waiters.insert(
        uuid,
        Waiter::Unicast {
            requester: connection,
        },
    );

    tracing::debug!("dispatching {} to {id} as {uuid}", args.endpoint);

    let dispatch = Dispatch::new(args.endpoint, args.kwargs, uuid, identifier.to_owned());
    if !broker.state().send(worker_connection, to_message(&dispatch)) {
        // The worker dropped before teardown caught up; the waiter would
        // never resolve.
        broker.state().waiters.remove(&uuid);
        tracing::warn!("failed to dispatch {uuid}: worker connection is gone");
    }

    true
}

/// Dispatch a request to every registered shard of the bot. Returns whether
/// the session continues.
fn create_request_all(
    broker: &Broker,
    connection: ConnectionId,
    bot_id: &str,
    args: RequestArgs,
    tx: &UnboundedSender<Message>,
) -> bool {
    let members = broker.state().shards_of(bot_id);

    if members.is_empty() {
        // Nothing to dispatch to; settle immediately.
        if args.wait_finish {
            send_frame(tx, &FanoutReply::finished(Map::new()));
        } else {
            send_frame(tx, &FanoutReply::sent());
        }

        return true;
    }

    // The endpoint set of an arbitrary registered shard decides whether the
    // endpoint is known.
    if !broker.state().shard_serves(&members[0].0, &args.endpoint) {
        send_frame(tx, &UnknownEndpoint::new());
        close(tx);

        return false;
    }

    let job = Uuid::new_v4();
    broker.state().fanouts.insert(
        job,
        FanoutJob {
            requester: connection,
            expected: members.len(),
            wait_finish: args.wait_finish,
            results: Map::new(),
        },
    );

    tracing::debug!(
        "fanning {} out to {} shards of bot {bot_id} as {job}",
        args.endpoint,
        members.len(),
    );

    for (member, worker_connection) in members {
        let uuid = Uuid::new_v4();
        broker.state().waiters.insert(
            uuid,
            Waiter::FanoutMember {
                job,
                identifier: member.identifier.clone(),
            },
        );

        let dispatch = Dispatch::new(
            args.endpoint.clone(),
            args.kwargs.clone(),
            uuid,
            member.identifier.clone(),
        );

        if !broker.state().send(worker_connection, to_message(&dispatch)) {
            // The member dropped between snapshot and dispatch; record an
            // empty response so a waiting job still settles.
            tracing::warn!("failed to dispatch {uuid} to {member}");
            broker.state().waiters.remove(&uuid);

            if let Some(mut entry) = broker.state().fanouts.get_mut(&job) {
                entry
                    .results
                    .insert(member.identifier, Value::Object(Map::new()));
            }
        }
    }

    if args.wait_finish {
        let finished = broker
            .state()
            .fanouts
            .get(&job)
            .map_or(false, |entry| entry.results.len() >= entry.expected);

        if finished {
            settle_fanout(broker, job);
        }
    } else {
        broker.state().fanouts.remove(&job);
        send_frame(tx, &FanoutReply::sent());
    }

    true
}

fn secret_ok(configured: Option<&str>, provided: Option<&str>) -> bool {
    match configured {
        Some(want) => provided == Some(want),
        None => provided.map_or(true, str::is_empty),
    }
}

fn to_message(frame: &impl Serialize) -> Message {
    Message::Text(serde_json::to_string(frame).expect("frame serialization never fails"))
}

fn send_frame(tx: &UnboundedSender<Message>, frame: &impl Serialize) {
    let _res = tx.send(to_message(frame));
}

fn close(tx: &UnboundedSender<Message>) {
    let _res = tx.send(Message::Close(None));
}

#[cfg(test)]
mod tests {
    use super::{secret_ok, Headers};
    use tokio_tungstenite::tungstenite::handshake::server::Request;

    #[test]
    fn secret_rules() {
        assert!(secret_ok(Some("s"), Some("s")));
        assert!(!secret_ok(Some("s"), Some("t")));
        assert!(!secret_ok(Some("s"), None));
        assert!(!secret_ok(Some("s"), Some("")));

        assert!(secret_ok(None, None));
        assert!(secret_ok(None, Some("")));
        assert!(!secret_ok(None, Some("s")));
    }

    #[test]
    fn captures_identity_headers() {
        let request = Request::get("ws://127.0.0.1/")
            .header("Secret-Key", "s")
            .header("Bot-ID", "42")
            .header("Identifier", "1")
            .body(())
            .unwrap();

        let headers = Headers::capture(&request);

        assert_eq!(headers.secret_key.as_deref(), Some("s"));
        assert_eq!(headers.bot_id.as_deref(), Some("42"));
        assert_eq!(headers.identifier.as_deref(), Some("1"));
        assert!(!headers.requester);
    }

    #[test]
    fn empty_identity_headers_are_missing() {
        let request = Request::get("ws://127.0.0.1/")
            .header("Bot-ID", "")
            .header("Endpoints", "create_request")
            .body(())
            .unwrap();

        let headers = Headers::capture(&request);

        assert!(headers.bot_id.is_none());
        assert!(headers.identifier.is_none());
        assert!(headers.requester);
    }
}

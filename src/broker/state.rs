//! Shared routing tables owned by the broker.
//!
//! Connections are identified by integer handles; only the connection map
//! stores a sender for the socket's writer task. The shard registry, the
//! pending-waiter table, and the fan-out table all refer to connections by
//! handle, so tearing a connection down is a scan-and-erase over plain ids.

use crate::model::ShardId;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub(crate) type ConnectionId = u64;

/// A registered shard: the connection serving it and its endpoint set.
#[derive(Debug)]
pub(crate) struct ShardRegistration {
    pub connection: ConnectionId,
    #[allow(dead_code)]
    pub client_id: u64,
    pub endpoints: HashSet<String>,
}

/// A pending request, keyed by its correlation UUID.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// A unicast request; the response is forwarded to the requester.
    Unicast { requester: ConnectionId },
    /// One member of a fan-out; the response is recorded into the job.
    FanoutMember { job: Uuid, identifier: String },
}

/// An in-flight fan-out, keyed by its fan-out UUID.
///
/// The member set and expected cardinality are frozen at dispatch time;
/// shards registering mid-flight are not added.
#[derive(Debug)]
pub(crate) struct FanoutJob {
    pub requester: ConnectionId,
    pub expected: usize,
    pub wait_finish: bool,
    pub results: Map<String, Value>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    connections: DashMap<ConnectionId, UnboundedSender<Message>>,
    pub shards: DashMap<ShardId, ShardRegistration>,
    pub waiters: DashMap<Uuid, Waiter>,
    pub fanouts: DashMap<Uuid, FanoutJob>,
    counter: AtomicU64,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's writer and allocate its handle.
    pub fn add_connection(&self, tx: UnboundedSender<Message>) -> ConnectionId {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(id, tx);

        id
    }

    /// Queue a message onto a connection's writer task.
    ///
    /// Returns `false` when the connection is gone or its writer has shut
    /// down.
    pub fn send(&self, connection: ConnectionId, message: Message) -> bool {
        self.connections
            .get(&connection)
            .map_or(false, |tx| tx.send(message).is_ok())
    }

    /// Whether any shard of the given bot is registered.
    pub fn bot_registered(&self, bot_id: &str) -> bool {
        self.shards.iter().any(|entry| entry.key().bot_id == bot_id)
    }

    /// Snapshot the registered shards of a bot as `(identity, connection)`
    /// pairs.
    pub fn shards_of(&self, bot_id: &str) -> Vec<(ShardId, ConnectionId)> {
        self.shards
            .iter()
            .filter(|entry| entry.key().bot_id == bot_id)
            .map(|entry| (entry.key().clone(), entry.value().connection))
            .collect()
    }

    /// Whether the given registered shard serves the named endpoint.
    pub fn shard_serves(&self, id: &ShardId, endpoint: &str) -> bool {
        self.shards
            .get(id)
            .map_or(false, |registration| {
                registration.endpoints.contains(endpoint)
            })
    }

    /// Remove a connection and every table entry referring to it.
    ///
    /// Registrations served by the connection are dropped (their persisted
    /// catalog entries are kept), unicast waiters owned by it become
    /// unresolvable and are erased, and its fan-out jobs are erased together
    /// with their member waiters.
    pub fn remove_connection(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
        self.shards
            .retain(|_, registration| registration.connection != connection);

        let mut dead_jobs = Vec::new();
        self.fanouts.retain(|id, job| {
            if job.requester == connection {
                dead_jobs.push(*id);

                false
            } else {
                true
            }
        });

        self.waiters.retain(|_, waiter| match waiter {
            Waiter::Unicast { requester } => *requester != connection,
            Waiter::FanoutMember { job, .. } => !dead_jobs.contains(job),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{FanoutJob, State, Waiter};
    use crate::model::ShardId;
    use serde_json::Map;
    use static_assertions::assert_impl_all;
    use std::{collections::HashSet, fmt::Debug};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    assert_impl_all!(State: Debug, Default, Send, Sync);

    fn register(state: &State, bot_id: &str, identifier: &str, connection: u64) {
        state.shards.insert(
            ShardId::new(bot_id, identifier),
            super::ShardRegistration {
                connection,
                client_id: 42,
                endpoints: HashSet::from(["ping".to_owned()]),
            },
        );
    }

    #[test]
    fn shard_snapshot_filters_by_bot() {
        let state = State::new();
        register(&state, "42", "1", 1);
        register(&state, "42", "2", 2);
        register(&state, "7", "1", 3);

        let mut members = state.shards_of("42");
        members.sort_by(|a, b| a.0.identifier.cmp(&b.0.identifier));

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, ShardId::new("42", "1"));
        assert_eq!(members[1].1, 2);
        assert!(state.bot_registered("7"));
        assert!(!state.bot_registered("13"));
    }

    #[test]
    fn teardown_erases_registrations_and_waiters() {
        let state = State::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let requester = state.add_connection(tx);
        register(&state, "42", "1", requester + 1);

        let unicast = Uuid::new_v4();
        state.waiters.insert(unicast, Waiter::Unicast { requester });

        let job = Uuid::new_v4();
        state.fanouts.insert(
            job,
            FanoutJob {
                requester,
                expected: 1,
                wait_finish: true,
                results: Map::new(),
            },
        );
        let member = Uuid::new_v4();
        state.waiters.insert(
            member,
            Waiter::FanoutMember {
                job,
                identifier: "1".to_owned(),
            },
        );

        state.remove_connection(requester);

        assert!(state.waiters.get(&unicast).is_none());
        assert!(state.waiters.get(&member).is_none());
        assert!(state.fanouts.get(&job).is_none());
        // The shard registered over a different connection survives.
        assert!(state.shards.get(&ShardId::new("42", "1")).is_some());

        state.remove_connection(requester + 1);
        assert!(state.shards.get(&ShardId::new("42", "1")).is_none());
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let state = State::new();

        assert!(!state.send(99, tokio_tungstenite::tungstenite::Message::Close(None)));
    }
}

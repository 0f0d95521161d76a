//! The central broker routing frames between requesters and workers.
//!
//! The broker is the only process with an accepting socket. Each accepted
//! connection is classified by its handshake headers into a worker or a
//! requester session and then driven by its own task; the shard registry,
//! the pending-waiter table, and the fan-out table are shared between those
//! tasks and correlate responses back to the requesters that asked for them.
//!
//! # Examples
//!
//! Bind a broker to an ephemeral port and run it:
//!
//! ```no_run
//! use shardbus::broker::{Broker, BrokerConfig};
//! use std::net::SocketAddr;
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = BrokerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
//! config.secret_key = Some("secret".to_owned());
//!
//! let broker = Broker::bind(config).await?;
//! println!("listening on {}", broker.local_addr());
//!
//! broker.run().await?;
//! # Ok(()) }
//! ```

mod connection;
mod state;

use crate::catalog::Catalog;
use state::State;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Error as IoError,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;

/// An error occurred while binding the broker or accepting connections.
#[derive(Debug)]
#[non_exhaustive]
pub enum BrokerError {
    /// Accepting a connection on the listener failed.
    Accepting {
        /// The source of the error from the listener.
        source: IoError,
    },
    /// Binding the listening socket failed.
    Binding {
        /// The address that couldn't be bound.
        address: SocketAddr,
        /// The source of the error from the listener.
        source: IoError,
    },
    /// [`Broker::run`] was called a second time.
    AlreadyRunning,
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Accepting { .. } => f.write_str("failed to accept a connection"),
            Self::Binding { address, .. } => {
                write!(f, "failed to bind the listener to {address}")
            }
            Self::AlreadyRunning => f.write_str("the broker is already running"),
        }
    }
}

impl Error for BrokerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Accepting { source } => Some(source),
            Self::Binding { source, .. } => Some(source),
            Self::AlreadyRunning => None,
        }
    }
}

/// The configuration a [`Broker`] is created from.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct BrokerConfig {
    /// The address to listen on.
    pub address: SocketAddr,
    /// The shared secret connections must present in their `Secret-Key`
    /// header.
    ///
    /// With no secret configured, only connections presenting an absent or
    /// empty header are accepted.
    pub secret_key: Option<String>,
    /// Root directory of the persisted endpoint catalog.
    pub catalog_dir: PathBuf,
}

impl BrokerConfig {
    /// Create a configuration listening on the given address, with no
    /// secret and the catalog rooted at `db`.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            secret_key: None,
            catalog_dir: PathBuf::from("db"),
        }
    }
}

#[derive(Debug)]
struct BrokerRef {
    address: SocketAddr,
    catalog: Catalog,
    listener: Mutex<Option<TcpListener>>,
    secret_key: Option<String>,
    state: State,
}

/// The broker: accepts connections, routes frames, and owns the routing
/// tables.
///
/// # Cloning
///
/// The broker internally wraps its state within an Arc, so it can be cloned
/// and passed around tasks cheaply.
#[derive(Clone, Debug)]
pub struct Broker(Arc<BrokerRef>);

impl Broker {
    /// Bind the listening socket described by the configuration.
    ///
    /// Binding to port 0 assigns an ephemeral port; retrieve it via
    /// [`local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Binding`] when the address can't be bound.
    ///
    /// [`local_addr`]: Self::local_addr
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(config.address)
            .await
            .map_err(|source| BrokerError::Binding {
                address: config.address,
                source,
            })?;
        let address = listener.local_addr().map_err(|source| BrokerError::Binding {
            address: config.address,
            source,
        })?;

        tracing::info!("broker listening on {address}");

        Ok(Self(Arc::new(BrokerRef {
            address,
            catalog: Catalog::new(config.catalog_dir),
            listener: Mutex::new(Some(listener)),
            secret_key: config.secret_key,
            state: State::new(),
        })))
    }

    /// Return the address the broker is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.address
    }

    /// Accept and serve connections until the listener fails.
    ///
    /// Each accepted connection runs in its own task; this future only
    /// completes on listener errors.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AlreadyRunning`] when called twice and
    /// [`BrokerError::Accepting`] when the listener fails.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = self
            .0
            .listener
            .lock()
            .expect("listener poisoned")
            .take()
            .ok_or(BrokerError::AlreadyRunning)?;

        loop {
            let (stream, remote) = listener
                .accept()
                .await
                .map_err(|source| BrokerError::Accepting { source })?;

            tracing::debug!("accepted connection from {remote}");

            let broker = self.clone();
            tokio::spawn(async move {
                connection::handle(broker, stream).await;
            });
        }
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.0.catalog
    }

    pub(crate) fn secret_key(&self) -> Option<&str> {
        self.0.secret_key.as_deref()
    }

    pub(crate) fn state(&self) -> &State {
        &self.0.state
    }
}

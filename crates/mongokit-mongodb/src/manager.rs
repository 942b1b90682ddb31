//! Process-wide connection handle with explicit lifecycle state
//!
//! A [`ConnectionManager`] is initialised once, opens its connection on a
//! background task, and hands the same `Arc` to every caller of
//! [`ConnectionManager::get_connection`], whether they asked before or after
//! the connection opened.

use async_trait::async_trait;
use mongokit_common::{MongoKitError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectOptions, ConnectOverrides};

/// Opens connections for a manager
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: ManagedConnection;

    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Self::Connection>;
}

/// A connection that can be closed
#[async_trait]
pub trait ManagedConnection: Send + Sync + 'static {
    async fn close(&self) -> Result<()>;
}

/// Lifecycle state of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unresolved,
    Resolving,
    Open,
    Closed,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unresolved => write!(f, "unresolved"),
            ConnectionState::Resolving => write!(f, "resolving"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Errored => write!(f, "errored"),
        }
    }
}

/// Events observed on the connection, each emitted as a log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Error(String),
    Open,
    Disconnecting,
    Disconnected,
}

impl LifecycleEvent {
    fn log(&self) {
        match self {
            LifecycleEvent::Error(message) => error!(error = %message, "mongodb connection error"),
            LifecycleEvent::Open => info!("mongodb connection open"),
            LifecycleEvent::Disconnecting => info!("shutting down db connection"),
            LifecycleEvent::Disconnected => {
                info!("mongodb connection successfully disconnected")
            }
        }
    }
}

/// Result of the single open attempt, shared with every waiter
enum Slot<T> {
    Pending,
    Open(Arc<T>),
    Failed(MongoKitError),
}

struct Inner<C: Connector> {
    connector: C,
    initialized: AtomicBool,
    state: Mutex<ConnectionState>,
    options: Mutex<ConnectOptions>,
    slot: watch::Sender<Slot<C::Connection>>,
}

/// Injectable connection handle; clones share the same underlying state
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        let (slot, _) = watch::channel(Slot::Pending);
        Self {
            inner: Arc::new(Inner {
                connector,
                initialized: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Unresolved),
                options: Mutex::new(ConnectOptions::default()),
                slot,
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Options in effect (defaults until the first successful init)
    pub fn options(&self) -> ConnectOptions {
        self.inner.options.lock().clone()
    }

    /// Start opening the connection.
    ///
    /// Only the first call with a non-empty `uri` has an effect; later calls
    /// return `Ok(())` without looking at their arguments. The first call
    /// must be made from within a tokio runtime.
    pub fn init_connection(&self, uri: &str, overrides: &ConnectOverrides) -> Result<()> {
        if uri.trim().is_empty() {
            return Err(MongoKitError::InvalidConfiguration(format!(
                "mongodb uri '{}' is invalid",
                uri
            )));
        }

        if self.inner.initialized.load(Ordering::SeqCst) {
            debug!("connection already initialized, ignoring init_connection");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            MongoKitError::Internal(format!("init_connection needs a tokio runtime: {}", e))
        })?;

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("connection already initialized, ignoring init_connection");
            return Ok(());
        }

        let options = ConnectOptions::default().merged(overrides);
        *self.inner.options.lock() = options.clone();
        *self.inner.state.lock() = ConnectionState::Resolving;

        let manager = self.clone();
        let uri = uri.to_string();
        runtime.spawn(async move { manager.open(uri, options).await });

        Ok(())
    }

    #[instrument(skip_all, fields(reconnect_tries = options.reconnect_tries))]
    async fn open(&self, uri: String, options: ConnectOptions) {
        let mut failures: u32 = 0;
        loop {
            if self.settled() {
                debug!(state = %self.state(), "handle settled while connecting, giving up");
                return;
            }
            match self.inner.connector.connect(&uri, &options).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    if self.resolve(ConnectionState::Open, Slot::Open(Arc::clone(&connection))) {
                        LifecycleEvent::Open.log();
                    } else {
                        debug!(state = %self.state(), "connection opened after the handle settled, closing it");
                        let closed =
                            close_within(connection.as_ref(), options.shutdown_timeout).await;
                        if let Err(err) = closed {
                            error!(error = %err, "failed to close late db connection");
                        }
                    }
                    return;
                }
                Err(err) => {
                    // a refused connection has already settled the slot
                    if self.report_error(err.clone()).is_err() {
                        return;
                    }
                    if err.is_fatal() {
                        self.resolve(ConnectionState::Errored, Slot::Failed(err));
                        return;
                    }
                    failures = failures.saturating_add(1);
                    if failures >= options.reconnect_tries {
                        warn!(failures, "giving up on mongodb connection");
                        self.resolve(ConnectionState::Errored, Slot::Failed(err));
                        return;
                    }
                    tokio::time::sleep(options.reconnect_interval).await;
                }
            }
        }
    }

    /// True once shutdown ran or the slot holds a result
    fn settled(&self) -> bool {
        let state = self.inner.state.lock();
        let pending = matches!(*self.inner.slot.borrow(), Slot::Pending);
        *state == ConnectionState::Closed || !pending
    }

    /// Settle the slot once. Returns false if it was already settled or the
    /// handle was shut down first.
    fn resolve(&self, state: ConnectionState, slot: Slot<C::Connection>) -> bool {
        let mut current = self.inner.state.lock();
        let pending = matches!(*self.inner.slot.borrow(), Slot::Pending);
        if *current == ConnectionState::Closed || !pending {
            return false;
        }
        *current = state;
        self.inner.slot.send_replace(slot);
        true
    }

    /// The error observer.
    ///
    /// A refused connection is re-raised as `ConnectionRefused`; if the open
    /// is still pending, waiters receive the same error. Any other error is
    /// logged and swallowed.
    pub fn report_error(&self, err: MongoKitError) -> Result<()> {
        LifecycleEvent::Error(err.to_string()).log();
        if err.is_connection_refused() {
            let refused = match err {
                MongoKitError::ConnectionRefused(msg) => MongoKitError::ConnectionRefused(msg),
                other => MongoKitError::ConnectionRefused(other.to_string()),
            };
            if !self.resolve(ConnectionState::Errored, Slot::Failed(refused.clone())) {
                let mut state = self.inner.state.lock();
                if *state != ConnectionState::Closed {
                    *state = ConnectionState::Errored;
                }
            }
            return Err(refused);
        }
        Ok(())
    }

    /// Wait for the connection to open and return it.
    ///
    /// Every caller receives the same instance. Waits indefinitely if
    /// `init_connection` is never called.
    pub async fn get_connection(&self) -> Result<Arc<C::Connection>> {
        let mut rx = self.inner.slot.subscribe();
        let connection = {
            let slot = rx
                .wait_for(|slot| !matches!(slot, Slot::Pending))
                .await
                .map_err(|e| MongoKitError::Internal(format!("connection slot dropped: {}", e)))?;
            let connection = match &*slot {
                Slot::Open(connection) => Arc::clone(connection),
                Slot::Failed(err) => return Err(err.clone()),
                Slot::Pending => {
                    return Err(MongoKitError::Internal(
                        "connection slot still pending".to_string(),
                    ))
                }
            };
            connection
        };

        if self.state() == ConnectionState::Closed {
            return Err(MongoKitError::Connection("connection closed".to_string()));
        }
        Ok(connection)
    }

    /// The open connection, if there is one, without waiting
    pub fn try_connection(&self) -> Option<Arc<C::Connection>> {
        if self.state() != ConnectionState::Open {
            return None;
        }
        match &*self.inner.slot.borrow() {
            Slot::Open(connection) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Close the connection within the configured shutdown timeout.
    ///
    /// Never fails: a close error or timeout is logged and the handle is
    /// marked closed regardless, since shutdown may race with in-flight writes.
    /// A shutdown while the connection is still opening stops the open: waiters
    /// get a "connection closed" error and a connection that opens later is
    /// closed by the open task.
    pub async fn shutdown(&self) {
        if self.abandon_open() {
            LifecycleEvent::Disconnected.log();
            return;
        }

        let Some(connection) = self.try_connection() else {
            debug!(state = %self.state(), "no open connection to shut down");
            return;
        };

        LifecycleEvent::Disconnecting.log();
        let timeout = self.inner.options.lock().shutdown_timeout;
        let outcome = close_within(connection.as_ref(), timeout).await;

        *self.inner.state.lock() = ConnectionState::Closed;
        match outcome {
            Ok(()) => LifecycleEvent::Disconnected.log(),
            Err(err) => error!(error = %err, "failed to close db connection"),
        }
    }

    /// Mark a still-resolving handle closed. Returns false in any other state.
    fn abandon_open(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state != ConnectionState::Resolving {
            return false;
        }
        *state = ConnectionState::Closed;
        self.inner.slot.send_replace(Slot::Failed(MongoKitError::Connection(
            "connection closed".to_string(),
        )));
        true
    }
}

async fn close_within<T: ManagedConnection>(connection: &T, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, connection.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(MongoKitError::Shutdown(err.to_string())),
        Err(_) => Err(MongoKitError::Shutdown(format!(
            "close did not finish within {}ms",
            timeout.as_millis()
        ))),
    }
}

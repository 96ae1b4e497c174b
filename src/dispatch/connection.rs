use std::{
    fmt::{Display, Formatter},
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    clients::broker::{Broker, BrokerConnection},
    models::error::DispatchError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Absent,
    Live,
    /// Still held, but the broker side has gone away.
    Stale,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Absent => write!(f, "absent"),
            ConnectionStatus::Live => write!(f, "live"),
            ConnectionStatus::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    idle_timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Shared {
    state: Mutex<ConnectionState>,
    in_use: AtomicUsize,
    dials: AtomicU64,
}

/// Owns the single broker connection of the process.
///
/// The connection is dialed on first use and dropped after `idle_timeout`
/// without an [`acquire`](Self::acquire). Liveness check, dial and idle timer
/// reset all happen under one lock, so concurrent callers never dial twice.
/// The idle timer takes the same lock and leaves the connection alone while
/// any [`ConnectionLease`] is outstanding.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    uri: String,
    idle_timeout: Duration,
    dial_timeout: Duration,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        uri: impl Into<String>,
        idle_timeout: Duration,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            uri: uri.into(),
            idle_timeout,
            dial_timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::default()),
                in_use: AtomicUsize::new(0),
                dials: AtomicU64::new(0),
            }),
        }
    }

    pub async fn acquire(&self) -> Result<ConnectionLease, DispatchError> {
        let mut state = self.shared.state.lock().await;

        let live = state.connection.as_ref().filter(|c| !c.is_closed()).cloned();
        let connection = match live {
            Some(connection) => connection,
            None => {
                if state.connection.take().is_some() {
                    warn!("Broker closed the connection, reconnecting");
                }
                let connection = self.dial().await?;
                state.connection = Some(Arc::clone(&connection));
                connection
            }
        };

        self.arm_idle_timer(&mut state);
        self.shared.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(ConnectionLease {
            connection,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, DispatchError> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);

        match timeout(self.dial_timeout, self.broker.connect(&self.uri)).await {
            Ok(Ok(connection)) => {
                info!("Connected to message broker");
                Ok(connection)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to connect to message broker");
                Err(DispatchError::Connection(e.to_string()))
            }
            Err(_) => {
                let dial_timeout_ms = self.dial_timeout.as_millis() as u64;
                warn!(dial_timeout_ms, "Timed out connecting to message broker");
                Err(DispatchError::Connection(format!(
                    "no answer from broker within {:?}",
                    self.dial_timeout
                )))
            }
        }
    }

    fn arm_idle_timer(&self, state: &mut ConnectionState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        state.generation += 1;

        let generation = state.generation;
        let idle_timeout = self.idle_timeout;
        let shared = Arc::downgrade(&self.shared);

        state.idle_timer = Some(tokio::spawn(idle_disconnect(
            shared,
            generation,
            idle_timeout,
        )));
    }

    pub async fn status(&self) -> ConnectionStatus {
        let state = self.shared.state.lock().await;
        match &state.connection {
            None => ConnectionStatus::Absent,
            Some(c) if c.is_closed() => ConnectionStatus::Stale,
            Some(_) => ConnectionStatus::Live,
        }
    }

    /// Number of dial attempts since creation.
    pub fn dial_count(&self) -> u64 {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// Leases currently held by in-flight dispatches.
    pub fn leases_in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::SeqCst)
    }

    /// Closes the connection now, regardless of outstanding leases. Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        state.generation += 1;
        close_connection(&mut state, "Broker connection closed").await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
        }
    }
}

async fn idle_disconnect(shared: Weak<Shared>, generation: u64, idle_timeout: Duration) {
    loop {
        tokio::time::sleep(idle_timeout).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().await;

        if state.generation != generation {
            return;
        }

        let in_use = shared.in_use.load(Ordering::SeqCst);
        if in_use > 0 {
            debug!(in_use, "Idle timeout reached while connection in use, deferring");
            continue;
        }

        state.idle_timer = None;
        close_connection(&mut state, "Broker connection closed after idle timeout").await;
        return;
    }
}

async fn close_connection(state: &mut ConnectionState, reason: &str) {
    if let Some(connection) = state.connection.take() {
        if let Err(e) = connection.close().await {
            debug!(error = %e, "Error while closing broker connection");
        }
        info!("{}", reason);
    }
}

/// A borrowed handle on the live connection. Dropping it releases the hold
/// that keeps the idle timer from closing the connection.
pub struct ConnectionLease {
    connection: Arc<dyn BrokerConnection>,
    shared: Arc<Shared>,
}

impl Deref for ConnectionLease {
    type Target = dyn BrokerConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl ConnectionLease {
    pub fn same_connection(&self, other: &ConnectionLease) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

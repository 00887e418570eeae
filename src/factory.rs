//! Outgoing connection management.
//!
//! [`ConnectionFactory`] hands out one shared connection per
//! [`ConnectionKey`]. Concurrent callers asking for overlapping endpoints share
//! a single connection attempt, and endpoints that failed recently are tried
//! after the others.
//!
//! # Example
//!
//! ```ignore
//! let factory = ConnectionFactory::new(Arc::new(TcpConnector::new()), FactoryOptions::default());
//! let endpoints = ["tcp://h1:4061".parse()?, "tcp://h2:4061".parse()?];
//! let connection = factory.get_or_create(&endpoints, false, "").await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::FactoryOptions;
use crate::connection::Connection;
use crate::endpoint::{ConnectionKey, Endpoint, EndpointKey};
use crate::error::{Result, RpcError};
use crate::transport::Connector;

/// Result of one shared connection attempt.
#[derive(Clone)]
struct AttemptOutcome {
    result: Result<Connection>,
    /// Candidates the attempt dialed and failed, in dial order.
    failed: Vec<(EndpointKey, RpcError)>,
}

type OutcomeReceiver = watch::Receiver<Option<AttemptOutcome>>;

struct PendingAttempt {
    attempt: u64,
    outcome: OutcomeReceiver,
}

#[derive(Default)]
struct FactoryState {
    disposed: bool,
    connections: HashMap<ConnectionKey, Connection>,
    pending: HashMap<ConnectionKey, PendingAttempt>,
    failures: HashMap<EndpointKey, Instant>,
    attempts: JoinSet<()>,
    next_attempt: u64,
}

struct FactoryInner {
    connector: Arc<dyn Connector>,
    options: FactoryOptions,
    state: Mutex<FactoryState>,
}

/// Creates, shares and tracks outgoing connections.
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("ConnectionFactory")
            .field("connections", &state.connections.len())
            .field("pending", &state.pending.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

enum Next {
    Ready(Connection),
    Wait(OutcomeReceiver),
    Exhausted,
}

impl ConnectionFactory {
    /// Create a factory dialing through `connector`.
    pub fn new(connector: Arc<dyn Connector>, options: FactoryOptions) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                connector,
                options,
                state: Mutex::new(FactoryState::default()),
            }),
        }
    }

    /// Return an active connection to one of `endpoints`, creating one if
    /// needed.
    ///
    /// Candidates are dialed one after the other, endpoints without a recent
    /// failure first. `has_more` tells whether the caller has further
    /// candidates to try after these; it only affects logging. On exhaustion
    /// the last connection error is returned unchanged.
    pub async fn get_or_create(
        &self,
        endpoints: &[Endpoint],
        has_more: bool,
        connection_id: &str,
    ) -> Result<Connection> {
        if endpoints.is_empty() {
            return Err(RpcError::ResolutionFailed("no endpoints to connect to".to_string()));
        }
        let wanted: HashSet<EndpointKey> = endpoints.iter().map(Endpoint::key).collect();
        let mut tried: HashSet<EndpointKey> = HashSet::new();
        let mut last_error = None;

        loop {
            let next = self.next_step(endpoints, &tried, has_more, connection_id)?;
            let mut outcome = match next {
                Next::Ready(connection) => return Ok(connection),
                Next::Exhausted => break,
                Next::Wait(outcome) => outcome,
            };

            let outcome = match outcome.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            };
            let Some(outcome) = outcome else {
                return Err(RpcError::ConnectionAborted(
                    "connection attempt ended without a result".to_string(),
                ));
            };
            for (key, err) in outcome.failed {
                if wanted.contains(&key) {
                    last_error = Some(err);
                }
                tried.insert(key);
            }
            match outcome.result {
                Ok(connection) if wanted.contains(&connection.endpoint().key()) => {
                    return Ok(connection);
                }
                Ok(connection) => {
                    tracing::trace!(endpoint = %connection.endpoint(), "shared attempt connected elsewhere");
                }
                Err(RpcError::FactoryDisposed) => return Err(RpcError::FactoryDisposed),
                Err(err) => {
                    last_error.get_or_insert(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RpcError::ResolutionFailed("no candidate endpoint could be connected".to_string())
        }))
    }

    fn next_step(
        &self,
        endpoints: &[Endpoint],
        tried: &HashSet<EndpointKey>,
        has_more: bool,
        connection_id: &str,
    ) -> Result<Next> {
        let mut state = self.inner.state();
        if state.disposed {
            return Err(RpcError::FactoryDisposed);
        }

        for endpoint in endpoints {
            let key = ConnectionKey::new(endpoint, connection_id);
            if let Some(connection) = state.connections.get(&key) {
                if connection.is_active() {
                    return Ok(Next::Ready(connection.clone()));
                }
            }
        }

        let expiry = self.inner.options.failure_expiry;
        let now = Instant::now();
        state
            .failures
            .retain(|_, failed_at| now.duration_since(*failed_at) < expiry);

        let mut candidates: Vec<Endpoint> = endpoints
            .iter()
            .filter(|endpoint| !tried.contains(&endpoint.key()))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(Next::Exhausted);
        }
        // Stable: no recent failure first, then oldest failure first.
        candidates.sort_by_key(|endpoint| state.failures.get(&endpoint.key()).copied());

        let in_flight = candidates.iter().find_map(|endpoint| {
            state
                .pending
                .get(&ConnectionKey::new(endpoint, connection_id))
                .map(|pending| pending.outcome.clone())
        });
        if let Some(outcome) = in_flight {
            return Ok(Next::Wait(outcome));
        }

        let attempt = state.next_attempt;
        state.next_attempt += 1;
        let (tx, rx) = watch::channel(None);
        for endpoint in &candidates {
            state.pending.insert(
                ConnectionKey::new(endpoint, connection_id),
                PendingAttempt {
                    attempt,
                    outcome: rx.clone(),
                },
            );
        }
        while state.attempts.try_join_next().is_some() {}
        state.attempts.spawn(run_attempt(
            self.inner.clone(),
            attempt,
            candidates,
            connection_id.to_string(),
            has_more,
            tx,
        ));
        Ok(Next::Wait(rx))
    }

    /// Drop `connection` from the table without closing it.
    pub fn remove_connection(&self, connection: &Connection) {
        self.inner.forget(connection);
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state().connections.len()
    }

    /// When `endpoint` last failed, if that is recent enough to matter.
    pub fn recent_failure(&self, endpoint: &Endpoint) -> Option<Instant> {
        let state = self.inner.state();
        state
            .failures
            .get(&endpoint.key())
            .copied()
            .filter(|failed_at| failed_at.elapsed() < self.inner.options.failure_expiry)
    }

    /// Refuse further work, wait for attempts in flight, then gracefully
    /// close every connection and wait for all of them.
    pub async fn dispose(&self) {
        let mut attempts = {
            let mut state = self.inner.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.attempts)
        };
        // Attempts finishing now abort their own connections.
        while attempts.join_next().await.is_some() {}

        let connections: Vec<Connection> = {
            let mut state = self.inner.state();
            state.connections.drain().map(|(_, connection)| connection).collect()
        };
        tracing::debug!(connections = connections.len(), "disposing connection factory");

        let mut closing = JoinSet::new();
        for connection in connections {
            closing.spawn(async move {
                if let Err(err) = connection.close("connection factory disposed").await {
                    tracing::debug!(endpoint = %connection.endpoint(), error = %err, "close during dispose failed");
                }
            });
        }
        while closing.join_next().await.is_some() {}
    }
}

impl FactoryInner {
    fn state(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget(&self, connection: &Connection) {
        self.state()
            .connections
            .retain(|_, tracked| !tracked.ptr_eq(connection));
    }

    fn clear_pending(state: &mut FactoryState, attempt: u64) {
        state.pending.retain(|_, pending| pending.attempt != attempt);
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Connection> {
        let mut options = self.options.connection.clone();
        if let Some(timeout) = endpoint.timeout() {
            options.connect_timeout = timeout;
        }
        let timeout = options.connect_timeout;
        let transceiver = tokio::time::timeout(timeout, self.connector.connect(endpoint))
            .await
            .map_err(|_| {
                RpcError::transport(
                    endpoint.to_string(),
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })??;
        Connection::connect(transceiver, endpoint.clone(), options).await
    }
}

async fn run_attempt(
    inner: Arc<FactoryInner>,
    attempt: u64,
    candidates: Vec<Endpoint>,
    connection_id: String,
    has_more: bool,
    tx: watch::Sender<Option<AttemptOutcome>>,
) {
    let mut failed = Vec::new();
    let mut last_error = RpcError::ResolutionFailed("no candidate endpoint".to_string());
    let count = candidates.len();

    for (index, endpoint) in candidates.iter().enumerate() {
        if inner.state().disposed {
            last_error = RpcError::FactoryDisposed;
            break;
        }
        match inner.dial(endpoint).await {
            Ok(connection) => {
                let result = {
                    let mut state = inner.state();
                    FactoryInner::clear_pending(&mut state, attempt);
                    if state.disposed {
                        None
                    } else {
                        state.failures.remove(&endpoint.key());
                        state
                            .connections
                            .insert(ConnectionKey::new(endpoint, &connection_id), connection.clone());
                        Some(connection.clone())
                    }
                };
                let result = match result {
                    Some(connection) => {
                        tracing::debug!(endpoint = %endpoint, "connection established");
                        watch_close(&inner, connection.clone());
                        Ok(connection)
                    }
                    None => {
                        connection.abort(RpcError::FactoryDisposed).await;
                        Err(RpcError::FactoryDisposed)
                    }
                };
                tx.send_replace(Some(AttemptOutcome { result, failed }));
                return;
            }
            Err(err) => {
                inner.state().failures.insert(endpoint.key(), Instant::now());
                if index + 1 == count && !has_more {
                    tracing::warn!(endpoint = %endpoint, error = %err, "connection failed");
                } else {
                    tracing::debug!(endpoint = %endpoint, error = %err, "connection failed, trying next endpoint");
                }
                let disposed = matches!(err, RpcError::FactoryDisposed);
                failed.push((endpoint.key(), err.clone()));
                last_error = err;
                if disposed {
                    break;
                }
            }
        }
    }

    {
        let mut state = inner.state();
        FactoryInner::clear_pending(&mut state, attempt);
    }
    tx.send_replace(Some(AttemptOutcome {
        result: Err(last_error),
        failed,
    }));
}

/// Remove the connection from the table once it closes.
fn watch_close(inner: &Arc<FactoryInner>, connection: Connection) {
    let inner = Arc::downgrade(inner);
    tokio::spawn(async move {
        let reason = connection.closed().await;
        tracing::trace!(endpoint = %connection.endpoint(), reason = %reason, "factory connection closed");
        if let Some(inner) = inner.upgrade() {
            inner.forget(&connection);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::transport::{MemoryListener, MemoryNetwork};
    use std::time::Duration;

    fn serve(network: &MemoryNetwork, endpoint: &Endpoint) -> tokio::task::JoinHandle<()> {
        let listener: MemoryListener = network.listen(endpoint);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Ok(transceiver) = listener.accept().await {
                let endpoint = endpoint.clone();
                if let Ok(connection) =
                    Connection::accept(Arc::new(transceiver), endpoint, ConnectionOptions::default()).await
                {
                    accepted.push(connection);
                }
            }
        })
    }

    fn factory(network: &MemoryNetwork) -> ConnectionFactory {
        ConnectionFactory::new(Arc::new(network.clone()), FactoryOptions::default())
    }

    #[tokio::test]
    async fn test_reuses_connection() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        let factory = factory(&network);

        let first = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        let second = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(network.dial_count(&endpoint), 1);
        assert_eq!(factory.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_ids_are_separate() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        let factory = factory(&network);

        let shared = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        let private = factory.get_or_create(&[endpoint.clone()], false, "isolated").await.unwrap();
        assert!(!shared.ptr_eq(&private));
        assert_eq!(network.dial_count(&endpoint), 2);
    }

    #[tokio::test]
    async fn test_all_refused_returns_last_error() {
        let network = MemoryNetwork::new();
        let h1 = Endpoint::tcp("h1", 10);
        let h2 = Endpoint::tcp("h2", 10);
        network.refuse(&h1);
        network.refuse(&h2);
        let factory = factory(&network);

        let err = factory.get_or_create(&[h1.clone(), h2.clone()], false, "").await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert!(factory.recent_failure(&h1).is_some());
        assert!(factory.recent_failure(&h2).is_some());
        assert_eq!(network.dial_count(&h1), 1);
        assert_eq!(network.dial_count(&h2), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_forgotten() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        let factory = factory(&network);

        let connection = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        connection.close("done").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let fresh = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        assert!(!fresh.ptr_eq(&connection));
    }

    #[tokio::test]
    async fn test_dispose_closes_connections() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        let factory = factory(&network);

        let connection = factory.get_or_create(&[endpoint.clone()], false, "").await.unwrap();
        factory.dispose().await;
        assert_eq!(connection.phase(), crate::connection::Phase::Closed);
        assert!(matches!(
            factory.get_or_create(&[endpoint], false, "").await,
            Err(RpcError::FactoryDisposed)
        ));
    }

    #[tokio::test]
    async fn test_dispose_during_attempt() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        network.set_connect_delay(Duration::from_millis(50));
        let factory = factory(&network);

        let pending = {
            let factory = factory.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { factory.get_or_create(&[endpoint], false, "").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.dispose().await;

        assert!(matches!(pending.await.unwrap(), Err(RpcError::FactoryDisposed)));
        assert_eq!(factory.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_joined_attempt_reports_own_candidate_error() {
        let network = MemoryNetwork::new();
        let a = Endpoint::tcp("a", 10);
        let b = Endpoint::tcp("b", 10);
        network.refuse(&a);
        let _server = serve(&network, &b);
        network.set_connect_delay(Duration::from_millis(50));
        let factory = factory(&network);

        let first = {
            let factory = factory.clone();
            let group = vec![a.clone(), b.clone()];
            tokio::spawn(async move { factory.get_or_create(&group, false, "").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = factory.get_or_create(&[a.clone()], false, "").await;

        assert_eq!(first.await.unwrap().unwrap().endpoint(), &b);
        assert!(matches!(second, Err(RpcError::Transport { .. })), "{:?}", second.err());
        assert_eq!(network.dial_count(&a), 1);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_attempts_in_flight() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 10);
        let _server = serve(&network, &endpoint);
        network.set_connect_delay(Duration::from_millis(50));
        let factory = factory(&network);

        let pending = {
            let factory = factory.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { factory.get_or_create(&[endpoint], false, "").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.dispose().await;

        {
            let state = factory.inner.state();
            assert!(state.pending.is_empty());
            assert!(state.connections.is_empty());
        }
        assert!(matches!(pending.await.unwrap(), Err(RpcError::FactoryDisposed)));
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let factory = factory(&MemoryNetwork::new());
        assert!(matches!(
            factory.get_or_create(&[], false, "").await,
            Err(RpcError::ResolutionFailed(_))
        ));
    }
}

/// Per-key request coalescing.
///
/// At most one fetch-and-merge cycle runs per `SeriesKey`. The first caller
/// becomes the leader and holds a `Lease`; everyone arriving while the lease
/// is live gets a `ResultHandle` on the same outcome. The key is released
/// before waiters are woken, so a caller arriving after completion starts a
/// fresh cycle.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::SeriesKey;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoalesceError {
    #[error("in-flight work exceeded {0:?}")]
    Timeout(Duration),

    #[error("leader abandoned the work")]
    Abandoned,
}

type Slot<T> = Option<Result<T, CoalesceError>>;

struct InFlight<T> {
    generation: u64,
    rx: watch::Receiver<Slot<T>>,
}

struct KeyTable<T> {
    next_generation: u64,
    entries: HashMap<SeriesKey, InFlight<T>>,
}

type SharedTable<T> = Arc<Mutex<KeyTable<T>>>;

fn lock<T>(table: &Mutex<KeyTable<T>>) -> std::sync::MutexGuard<'_, KeyTable<T>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the in-flight key table
pub struct KeySynchronizer<T> {
    table: SharedTable<T>,
    deadline: Duration,
}

impl<T> KeySynchronizer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(deadline: Duration) -> Self {
        KeySynchronizer {
            table: Arc::new(Mutex::new(KeyTable {
                next_generation: 0,
                entries: HashMap::new(),
            })),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Become leader for `key`, or join the cycle already running for it
    pub fn acquire_or_join(&self, key: &SeriesKey) -> Ticket<T> {
        let mut table = lock(&self.table);

        if let Some(entry) = table.entries.get(key) {
            debug!("Joining in-flight sync for {}", key);
            return Ticket::Follower(ResultHandle { rx: entry.rx.clone() });
        }

        let generation = table.next_generation;
        table.next_generation += 1;

        let (tx, rx) = watch::channel(None);
        table.entries.insert(
            key.clone(),
            InFlight {
                generation,
                rx: rx.clone(),
            },
        );

        Ticket::Leader(
            Lease {
                key: key.clone(),
                generation,
                tx: Some(tx),
                table: Arc::clone(&self.table),
                deadline: self.deadline,
            },
            ResultHandle { rx },
        )
    }

    /// Number of keys with a live lease
    pub fn in_flight(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_in_flight(&self, key: &SeriesKey) -> bool {
        lock(&self.table).entries.contains_key(key)
    }
}

pub enum Ticket<T> {
    Leader(Lease<T>, ResultHandle<T>),
    Follower(ResultHandle<T>),
}

impl<T> Ticket<T> {
    pub fn is_leader(&self) -> bool {
        matches!(self, Ticket::Leader(..))
    }
}

/// Exclusive right to run the cycle for one key
pub struct Lease<T> {
    key: SeriesKey,
    generation: u64,
    tx: Option<watch::Sender<Slot<T>>>,
    table: SharedTable<T>,
    deadline: Duration,
}

impl<T> Lease<T> {
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Release the key, then wake every waiter with `outcome`
    fn publish(&mut self, outcome: Result<T, CoalesceError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        {
            let mut table = lock(&self.table);
            let owned = table
                .entries
                .get(&self.key)
                .map(|entry| entry.generation == self.generation)
                .unwrap_or(false);
            if owned {
                table.entries.remove(&self.key);
            }
        }

        tx.send_replace(Some(outcome));
    }
}

impl<T> Lease<T>
where
    T: Send + Sync + 'static,
{
    pub fn complete(mut self, value: T) {
        self.publish(Ok(value));
    }

    /// Run `work` on its own task under the synchronizer deadline.
    ///
    /// Dropping the caller's future does not cancel the work. On expiry the
    /// work is dropped and waiters receive [`CoalesceError::Timeout`].
    pub fn spawn<F>(self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut lease = self;
        tokio::spawn(async move {
            let deadline = lease.deadline;
            match tokio::time::timeout(deadline, work).await {
                Ok(value) => lease.publish(Ok(value)),
                Err(_) => {
                    warn!("Sync for {} exceeded deadline {:?}", lease.key, deadline);
                    lease.publish(Err(CoalesceError::Timeout(deadline)));
                }
            }
        })
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Lease for {} dropped without an outcome", self.key);
            self.publish(Err(CoalesceError::Abandoned));
        }
    }
}

/// Shared view of one cycle's outcome
pub struct ResultHandle<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        ResultHandle { rx: self.rx.clone() }
    }
}

impl<T: Clone> ResultHandle<T> {
    /// Wait at most `timeout` for the outcome
    pub async fn wait(&self, timeout: Duration) -> Result<T, CoalesceError> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, async move {
            let slot = rx.wait_for(Option::is_some).await.map(|slot| (*slot).clone());
            match slot {
                Ok(Some(outcome)) => outcome,
                _ => Err(CoalesceError::Abandoned),
            }
        })
        .await;

        waited.unwrap_or(Err(CoalesceError::Timeout(timeout)))
    }

    /// Outcome if already published
    pub fn peek(&self) -> Option<Result<T, CoalesceError>> {
        self.rx.borrow().clone()
    }
}

//! Batch scheduler implementation

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use crate::config::SchedulerConfig;
use crate::error::BatchError;
use crate::identify::{BatchCompleted, BatchTrigger, CompletionNotifier, Identifiable};
use crate::timer::{Timer, TimerCallback, TimerHandle, TokioTimer};

type Outcome<T, E> = Result<T, BatchError<E>>;
type SharedOutcome<T, E> = Shared<oneshot::Receiver<Outcome<T, E>>>;

/// What the winning trigger path needs to settle a batch.
struct Settlement<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    producer: JoinHandle<Outcome<T, E>>,
    sender: oneshot::Sender<Outcome<T, E>>,
}

struct BatchState<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    participants: u32,
    /// `Some` while the batch is open. Taken exactly once by whichever
    /// trigger settles the batch.
    settlement: Option<Settlement<T, E>>,
    timer: Option<TimerHandle>,
}

struct Batch<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    id: u64,
    key: String,
    expires_at: i64,
    outcome: SharedOutcome<T, E>,
    state: Mutex<BatchState<T, E>>,
}

impl<T, E> Batch<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn is_open(&self) -> bool {
        self.state.lock().settlement.is_some()
    }

    /// Close the batch for joining and cancel its window timer.
    ///
    /// Callers hold the registry lock. Returns `None` if another path
    /// already claimed it.
    fn claim(&self) -> Option<(Settlement<T, E>, u32)> {
        let mut state = self.state.lock();
        let settlement = state.settlement.take()?;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        Some((settlement, state.participants))
    }
}

/// In-flight batches keyed by coalescing key.
///
/// A key normally maps to a single batch. It can briefly hold more when a
/// batch whose window passed is still waiting on its factory while a new
/// one has opened.
struct Registry<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    batches: HashMap<String, Vec<Arc<Batch<T, E>>>>,
    next_id: u64,
}

impl<T, E> Registry<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            batches: HashMap::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn len(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    /// Drop claimed records past their retention deadline. A batch that has
    /// not been claimed still has waiters, so it stays until it settles.
    fn sweep(&mut self, now: i64, window_ms: i64, config: &SchedulerConfig) -> usize {
        let mut swept = 0;
        self.batches.retain(|_, list| {
            let before = list.len();
            list.retain(|batch| {
                batch.is_open() || config.retain_until(batch.expires_at, window_ms) > now
            });
            swept += before - list.len();
            !list.is_empty()
        });
        swept
    }

    /// Open batch for `key` still accepting participants at `now`.
    ///
    /// There should be at most one; if not, the latest-expiring wins.
    fn find_open(&self, key: &str, now: i64) -> Option<Arc<Batch<T, E>>> {
        self.batches
            .get(key)?
            .iter()
            .filter(|batch| batch.expires_at > now && batch.is_open())
            .max_by_key(|batch| batch.expires_at)
            .cloned()
    }

    fn insert(&mut self, batch: Arc<Batch<T, E>>) {
        self.batches.entry(batch.key.clone()).or_default().push(batch);
    }

    /// Remove by identity. Returns false if the record is already gone.
    fn remove(&mut self, batch: &Batch<T, E>) -> bool {
        let Some(list) = self.batches.get_mut(&batch.key) else {
            return false;
        };
        let before = list.len();
        list.retain(|b| b.id != batch.id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.batches.remove(&batch.key);
        }
        removed
    }
}

#[derive(Default)]
struct StatsInner {
    batches_created: AtomicU64,
    joins: AtomicU64,
    size_triggers: AtomicU64,
    window_triggers: AtomicU64,
    swept: AtomicU64,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Batches opened (one factory run each)
    pub batches_created: u64,
    /// Calls that joined an existing batch
    pub joins: u64,
    /// Batches settled because they reached their maximum size
    pub size_triggers: u64,
    /// Batches settled because their window elapsed
    pub window_triggers: u64,
    /// Records dropped by the retention sweep
    pub swept: u64,
    /// Records currently in the registry
    pub pending: usize,
}

impl SchedulerStats {
    /// Fraction of calls that were served by another call's factory run.
    pub fn coalescing_ratio(&self) -> f64 {
        let total = self.batches_created + self.joins;
        if total == 0 {
            0.0
        } else {
            self.joins as f64 / total as f64
        }
    }
}

struct SchedulerInner<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: SchedulerConfig,
    timer: Arc<dyn Timer>,
    registry: Mutex<Registry<T, E>>,
    notifier: RwLock<Option<CompletionNotifier>>,
    stats: StatsInner,
}

/// Coalesces concurrent calls that share a key into one factory run.
///
/// Every call carries its own logical timestamp (`now`, in milliseconds).
/// Grouping compares those timestamps only and never reads the clock, so
/// tests can drive the scheduler with virtual time. The window timer runs on
/// the configured [`Timer`].
///
/// All registry reads and writes for a call happen under one lock, so two
/// concurrent callers can never both create a batch for the same key.
///
/// Must be used from within a Tokio runtime: factories run as spawned tasks.
pub struct BatchScheduler<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    inner: Arc<SchedulerInner<T, E>>,
}

impl<T, E> Clone for BatchScheduler<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for BatchScheduler<T, E>
where
    T: Identifiable + Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl<T, E> BatchScheduler<T, E>
where
    T: Identifiable + Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a scheduler that uses [`TokioTimer`] for batch windows
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_timer(config, Arc::new(TokioTimer))
    }

    pub fn with_timer(config: SchedulerConfig, timer: Arc<dyn Timer>) -> Self {
        tracing::debug!(?config, "BatchScheduler::new");
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                timer,
                registry: Mutex::new(Registry::new()),
                notifier: RwLock::new(None),
                stats: StatsInner::default(),
            }),
        }
    }

    /// Install the callback that receives one report per settled batch
    /// whose result carries an id. Replaces any previous callback.
    pub fn set_completion_notifier<F>(&self, callback: F)
    where
        F: Fn(BatchCompleted) + Send + Sync + 'static,
    {
        *self.inner.notifier.write() = Some(Arc::new(callback));
    }

    pub fn clear_completion_notifier(&self) {
        *self.inner.notifier.write() = None;
    }

    /// Run `factory` for `key`, or share the run of an open batch.
    ///
    /// The join-or-create decision is made before this returns, and a new
    /// batch's factory is started immediately. The returned future resolves
    /// when the batch settles: when `max_size` participants have joined or
    /// `window_ms` has elapsed on the timer, whichever comes first. Every
    /// participant receives the same outcome.
    ///
    /// `factory` is only called when this call opens a new batch.
    ///
    /// # Errors
    ///
    /// The future resolves to [`BatchError::InvalidRequest`] for an empty
    /// key, a non-positive window or a zero `max_size`, and to
    /// [`BatchError::Factory`] when the batch's factory fails.
    pub fn execute_coalesced<F, Fut>(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        max_size: u32,
        factory: F,
    ) -> BoxFuture<'static, Outcome<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Err(reason) = validate_request(key, window_ms, max_size) {
            tracing::warn!(key, window_ms, max_size, reason, "Rejected coalescing request");
            return futures::future::ready(Err(BatchError::InvalidRequest(reason))).boxed();
        }

        let outcome = self.join_or_create(key, now, window_ms, max_size, factory);
        async move {
            outcome
                .await
                .unwrap_or_else(|_| Err(BatchError::Abandoned))
        }
        .boxed()
    }

    fn join_or_create<F, Fut>(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        max_size: u32,
        factory: F,
    ) -> SharedOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let inner = &self.inner;
        let mut registry = inner.registry.lock();

        let swept = registry.sweep(now, window_ms, &inner.config);
        if swept > 0 {
            inner.stats.swept.fetch_add(swept as u64, Ordering::Relaxed);
            tracing::debug!(swept, remaining = registry.len(), "Swept stale batch records");
        }

        if let Some(batch) = registry.find_open(key, now) {
            inner.stats.joins.fetch_add(1, Ordering::Relaxed);
            let mut state = batch.state.lock();
            state.participants += 1;
            let participants = state.participants;
            tracing::debug!(key, batch_id = batch.id, participants, max_size, "Joined batch");

            if participants >= max_size {
                let settlement = state.settlement.take();
                match settlement {
                    Some(settlement) => {
                        if let Some(timer) = state.timer.take() {
                            timer.cancel();
                        }
                        drop(state);
                        inner.stats.size_triggers.fetch_add(1, Ordering::Relaxed);
                        Self::spawn_settle(
                            Arc::clone(inner),
                            Arc::clone(&batch),
                            settlement,
                            participants,
                            BatchTrigger::SizeReached,
                        );
                    }
                    None => {
                        tracing::error!(
                            key,
                            batch_id = batch.id,
                            "Invariant violated: open batch had no settlement"
                        );
                    }
                }
            }

            return batch.outcome.clone();
        }

        let id = registry.next_id();
        let producer = tokio::spawn(run_factory(
            key.to_string(),
            factory(),
            inner.config.settle_timeout(),
        ));
        let (sender, receiver) = oneshot::channel();
        let outcome = receiver.shared();

        let batch = Arc::new(Batch {
            id,
            key: key.to_string(),
            expires_at: now.saturating_add(window_ms),
            outcome: outcome.clone(),
            state: Mutex::new(BatchState {
                participants: 1,
                settlement: Some(Settlement { producer, sender }),
                timer: None,
            }),
        });
        registry.insert(Arc::clone(&batch));
        inner.stats.batches_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            key,
            batch_id = id,
            window_ms,
            expires_at = batch.expires_at,
            "Opened batch"
        );

        if max_size <= 1 {
            if let Some((settlement, participants)) = batch.claim() {
                inner.stats.size_triggers.fetch_add(1, Ordering::Relaxed);
                Self::spawn_settle(
                    Arc::clone(inner),
                    batch,
                    settlement,
                    participants,
                    BatchTrigger::SizeReached,
                );
            }
            return outcome;
        }
        drop(registry);

        // Armed outside the registry lock: a timer may fire on any thread,
        // and its callback takes that lock.
        let handle = inner.timer.schedule(
            Duration::from_millis(window_ms.unsigned_abs()),
            Self::window_callback(Arc::downgrade(inner), Arc::clone(&batch)),
        );
        let mut state = batch.state.lock();
        if state.settlement.is_some() {
            state.timer = Some(handle);
        } else {
            // Filled up before the timer was armed
            handle.cancel();
        }

        outcome
    }

    fn window_callback(inner: Weak<SchedulerInner<T, E>>, batch: Arc<Batch<T, E>>) -> TimerCallback {
        Box::new(move || {
            let Some(inner) = inner.upgrade() else {
                tracing::debug!(batch_id = batch.id, "Scheduler dropped before batch window elapsed");
                return;
            };

            let claimed = {
                let _registry = inner.registry.lock();
                batch.claim()
            };

            match claimed {
                Some((settlement, participants)) => {
                    inner.stats.window_triggers.fetch_add(1, Ordering::Relaxed);
                    Self::spawn_settle(
                        inner,
                        batch,
                        settlement,
                        participants,
                        BatchTrigger::WindowElapsed,
                    );
                }
                None => tracing::trace!(batch_id = batch.id, "Window elapsed on an already settled batch"),
            }
        })
    }

    fn spawn_settle(
        inner: Arc<SchedulerInner<T, E>>,
        batch: Arc<Batch<T, E>>,
        settlement: Settlement<T, E>,
        participants: u32,
        trigger: BatchTrigger,
    ) {
        tokio::spawn(async move {
            inner.settle(&batch, settlement, participants, trigger).await;
        });
    }

    /// Settle every batch that is still open and cancel their timers.
    ///
    /// Batches settle as soon as their factories finish instead of waiting
    /// for their windows. Returns the number of batches flushed.
    pub fn shutdown(&self) -> usize {
        let claimed: Vec<_> = {
            let registry = self.inner.registry.lock();
            registry
                .batches
                .values()
                .flatten()
                .filter_map(|batch| {
                    batch
                        .claim()
                        .map(|(settlement, participants)| (Arc::clone(batch), settlement, participants))
                })
                .collect()
        };

        let flushed = claimed.len();
        for (batch, settlement, participants) in claimed {
            Self::spawn_settle(
                Arc::clone(&self.inner),
                batch,
                settlement,
                participants,
                BatchTrigger::Shutdown,
            );
        }

        tracing::info!(flushed, "Batch scheduler shut down");
        flushed
    }

    /// Number of batch records currently held, across all keys.
    pub fn pending_batches(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let stats = &self.inner.stats;
        SchedulerStats {
            batches_created: stats.batches_created.load(Ordering::Relaxed),
            joins: stats.joins.load(Ordering::Relaxed),
            size_triggers: stats.size_triggers.load(Ordering::Relaxed),
            window_triggers: stats.window_triggers.load(Ordering::Relaxed),
            swept: stats.swept.load(Ordering::Relaxed),
            pending: self.pending_batches(),
        }
    }
}

impl<T, E> SchedulerInner<T, E>
where
    T: Identifiable + Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn settle(
        &self,
        batch: &Batch<T, E>,
        settlement: Settlement<T, E>,
        participants: u32,
        trigger: BatchTrigger,
    ) {
        let Settlement { producer, sender } = settlement;
        let outcome = flatten_outcome(producer.await);

        match &outcome {
            Ok(value) => {
                if let Some(id) = value.batch_id() {
                    self.notify(BatchCompleted {
                        id: id.to_string(),
                        participant_count: participants,
                        trigger,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(key = %batch.key, batch_id = batch.id, participants, error = %e, "Batch failed");
            }
        }

        if sender.send(outcome).is_err() {
            tracing::debug!(batch_id = batch.id, "No participants left to receive the outcome");
        }

        if !self.registry.lock().remove(batch) {
            tracing::trace!(batch_id = batch.id, "Batch record was already swept");
        }

        tracing::info!(key = %batch.key, batch_id = batch.id, participants, ?trigger, "Batch settled");
    }

    fn notify(&self, event: BatchCompleted) {
        let notifier = self.notifier.read().clone();
        match notifier {
            Some(callback) => callback(event),
            None => tracing::trace!(id = %event.id, "No completion notifier installed"),
        }
    }
}

/// Producer task body. The settle timeout counts from here, when the batch
/// opens, so a slow factory is cut off even while the window is still open.
async fn run_factory<T, E, Fut>(key: String, factory: Fut, limit: Option<Duration>) -> Outcome<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, factory).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(key = %key, ?limit, "Batch factory timed out");
                return Err(BatchError::SettleTimeout(limit));
            }
        },
        None => factory.await,
    };
    result.map_err(|e| BatchError::Factory(Arc::new(e)))
}

fn flatten_outcome<T, E>(joined: Result<Outcome<T, E>, JoinError>) -> Outcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Batch factory task did not complete");
            Err(BatchError::FactoryAborted)
        }
    }
}

fn validate_request(key: &str, window_ms: i64, max_size: u32) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key must not be empty");
    }
    if window_ms <= 0 {
        return Err("window must be positive");
    }
    if max_size == 0 {
        return Err("max size must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq)]
    struct Reading(u32);
    impl Identifiable for Reading {}

    #[derive(Debug, Error)]
    #[error("never")]
    struct Never;

    fn scheduler() -> BatchScheduler<Reading, Never> {
        BatchScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request("k", 1, 1).is_ok());
        assert_eq!(validate_request("", 1, 1), Err("key must not be empty"));
        assert_eq!(validate_request("k", 0, 1), Err("window must be positive"));
        assert_eq!(validate_request("k", -5, 1), Err("window must be positive"));
        assert_eq!(validate_request("k", 1, 0), Err("max size must be at least 1"));
    }

    #[test]
    fn test_stats_ratio() {
        let stats = SchedulerStats {
            batches_created: 1,
            joins: 3,
            ..Default::default()
        };
        assert!((stats.coalescing_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(SchedulerStats::default().coalescing_ratio(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_leaves_registry_untouched() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = scheduler
            .execute_coalesced("", 0, 1000, 10, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Reading(1)) }
            })
            .await;

        assert!(matches!(result, Err(BatchError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_tracks_open_batch_per_key() {
        let scheduler = scheduler();

        let _a = scheduler.execute_coalesced("a", 0, 1000, 10, || async { Ok(Reading(1)) });
        let _b = scheduler.execute_coalesced("a", 10, 1000, 10, || async { Ok(Reading(2)) });
        let _c = scheduler.execute_coalesced("b", 10, 1000, 10, || async { Ok(Reading(3)) });

        assert_eq!(scheduler.pending_batches(), 2);
        let registry = scheduler.inner.registry.lock();
        let open = registry.find_open("a", 999);
        assert!(open.is_some());
        if let Some(batch) = open {
            let participants = batch.state.lock().participants;
            assert_eq!(participants, 2);
        }
        assert!(registry.find_open("a", 1000).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_records_within_retention() {
        let scheduler = scheduler();
        let _pending =
            scheduler.execute_coalesced("slow", 0, 100, 10, || futures::future::pending());

        let mut registry = scheduler.inner.registry.lock();
        let config = SchedulerConfig::default();

        // Unclaimed batches still have waiters, however old they are
        assert_eq!(registry.sweep(10_000, 100, &config), 0);

        let batch = registry.find_open("slow", 0).unwrap();
        let _claimed = batch.claim();

        // expires_at = 100, retained until 100 + 5 * 100
        assert_eq!(registry.sweep(599, 100, &config), 0);
        assert_eq!(registry.sweep(600, 100, &config), 1);
        assert_eq!(registry.len(), 0);
        assert!(registry.batches.is_empty());
    }
}

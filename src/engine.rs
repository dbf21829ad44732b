use crate::coverage::{CoverageRange, CoverageTracker, Gap};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::log::EventLog;
use crate::notify::{ChangeNotifier, SubscriptionId};
use crate::store::{KvStore, KvTxn, META};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Materialized aggregates: aggregation key bytes -> serialized record.
///
/// Folds may read their current record from this table inside the
/// delivery transaction; the engine owns the writes.
pub const AGGREGATES_TABLE: &str = "aggregates";

const COVERAGE_KEY: &[u8] = b"coverage";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// A post-fold aggregate change, broadcast to engine subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateChange {
    /// The aggregation key whose record changed.
    pub key: String,
    /// The record as persisted after the fold.
    pub record: Value,
}

/// The injected fold capability.
///
/// Runs inside the delivery transaction, together with the coverage
/// update it enables. Returning `Ok(None)` means the event produced no
/// materialized change — coverage still advances for that id, but no
/// change notification fires. When `Ok(Some(change))` is returned the
/// engine persists `change.record` under `change.key` in the aggregates
/// table within the same transaction.
///
/// Folds MUST be safe to re-apply for the same id: the catch-up path can
/// re-deliver events that were already folded (its backward batches are
/// not clipped to the gap being filled). A fold that must not
/// double-count keeps its own applied-id marker in a sub-store created by
/// the upgrade hook, or derives idempotence from the data (for example
/// most-recent-wins on a timestamp).
pub type FoldFn =
    Arc<dyn Fn(&mut dyn KvTxn, &Event) -> Result<Option<AggregateChange>> + Send + Sync>;

/// Schema upgrade hook: `(txn, from_version, to_version)`.
///
/// Runs exactly once per persisted-version increase, inside the
/// initialization transaction, before any fold executes. Creates or
/// alters whatever sub-stores the fold needs.
pub type UpgradeFn = Arc<dyn Fn(&mut dyn KvTxn, u32, u32) -> Result<()> + Send + Sync>;

/// Zero-value record for keys never touched by a fold.
pub type DefaultFn = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Engine tuning knobs. Batch size and tick interval are the only pacing
/// controls; there is no queue-depth admission control.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Schema version the injected fold expects. The upgrade hook runs
    /// when the persisted version is lower.
    pub schema_version: u32,
    /// Maximum events folded per catch-up batch (one transaction each).
    pub batch_size: usize,
    /// Period of the catch-up timer.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            schema_version: 1,
            batch_size: 100,
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// `initialize` has not been called.
    Uninitialized,
    /// Initialization in progress.
    Initializing,
    /// Ready; the catch-up timer is stopped.
    Idle,
    /// Ready; the catch-up timer is running.
    Processing,
    /// Initialization failed; the failure is remembered.
    FailedInit,
    /// Terminal. Every operation fails fast.
    Disposed,
}

enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready { processing: bool },
    FailedInit(String),
    Disposed,
}

/// Stop signal for the periodic catch-up task. The timer thread waits on
/// the condvar between ticks; cancellation is checked at each tick
/// boundary, never mid-transaction.
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Wait one tick interval. Returns true when stopped.
    fn wait_tick(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, interval);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }
}

struct TimerHandle {
    signal: Arc<StopSignal>,
    join: Option<thread::JoinHandle<()>>,
}

struct EngineState {
    lifecycle: Lifecycle,
    store: Option<Arc<dyn KvStore>>,
    log: Option<Arc<EventLog>>,
    coverage: CoverageTracker,
    log_subscription: Option<SubscriptionId>,
    timer: Option<TimerHandle>,
}

struct EngineInner {
    config: EngineConfig,
    fold: FoldFn,
    upgrade: UpgradeFn,
    default_record: DefaultFn,
    notifier: ChangeNotifier<AggregateChange>,
    state: Mutex<EngineState>,
}

/// Builder for [`AggregationEngine`].
pub struct EngineBuilder {
    store: Arc<dyn KvStore>,
    log: Arc<EventLog>,
    fold: FoldFn,
    upgrade: UpgradeFn,
    default_record: DefaultFn,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Schema version the fold expects (default 1).
    pub fn schema_version(mut self, version: u32) -> Self {
        self.config.schema_version = version;
        self
    }

    /// Catch-up batch size (default 100).
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    /// Catch-up timer period (default 250ms).
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Schema upgrade hook (default: no-op).
    pub fn upgrade(mut self, upgrade: UpgradeFn) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Zero-value record for untouched keys (default: `Value::Null`).
    pub fn default_record(mut self, default_record: DefaultFn) -> Self {
        self.default_record = default_record;
        self
    }

    /// Construct the engine. It starts `Uninitialized`; call
    /// [`AggregationEngine::initialize`] before anything else.
    pub fn build(self) -> AggregationEngine {
        AggregationEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                fold: self.fold,
                upgrade: self.upgrade,
                default_record: self.default_record,
                notifier: ChangeNotifier::new(),
                state: Mutex::new(EngineState {
                    lifecycle: Lifecycle::Uninitialized,
                    store: Some(self.store),
                    log: Some(self.log),
                    coverage: CoverageTracker::new(),
                    log_subscription: None,
                    timer: None,
                }),
            }),
        }
    }
}

/// Keeps the aggregate store consistent with the log.
///
/// Two delivery paths route through one transactional fold primitive:
/// the live path (invoked synchronously per successful append) and the
/// periodic backward catch-up path. Both commit the fold effect and the
/// coverage advance in a single transaction, so every event is folded
/// into the aggregate exactly once regardless of interleaving or process
/// restarts.
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

impl AggregationEngine {
    /// Start building an engine over a store, a log on that store, and a
    /// fold capability.
    pub fn builder(store: Arc<dyn KvStore>, log: Arc<EventLog>, fold: FoldFn) -> EngineBuilder {
        EngineBuilder {
            store,
            log,
            fold,
            upgrade: Arc::new(|_, _, _| Ok(())),
            default_record: Arc::new(|_| Value::Null),
            config: EngineConfig::default(),
        }
    }

    /// Open the store schema, run the upgrade hook if the persisted
    /// version is behind, load persisted coverage, and attach the live
    /// path to the log.
    ///
    /// Idempotent once successful. A failure is captured and remembered:
    /// subsequent calls (to this or any other operation) return the same
    /// `InitFailed` without re-running initialization.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match &state.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Ready { .. } => return Ok(()),
            Lifecycle::Initializing => return Err(Error::NotInitialized),
            Lifecycle::FailedInit(msg) => return Err(Error::InitFailed(msg.clone())),
            Lifecycle::Disposed => return Err(Error::Disposed),
        }
        state.lifecycle = Lifecycle::Initializing;

        match self.run_init(&mut state) {
            Ok(coverage) => {
                state.coverage = coverage;
                state.lifecycle = Lifecycle::Ready { processing: false };

                // Live path: fold each appended event as soon as its
                // append commits. The callback holds a weak handle so the
                // log does not keep a disposed engine alive.
                let weak = Arc::downgrade(&self.inner);
                let log = state.log.as_ref().cloned().ok_or(Error::Disposed)?;
                let tail_before = newest_id(&log)?;
                drop(state);
                let sub = log.subscribe(Box::new(move |event| {
                    if let Some(inner) = weak.upgrade() {
                        EngineInner::on_live_event(&inner, event);
                    }
                }));
                let mut state = self.inner.state.lock();
                if matches!(state.lifecycle, Lifecycle::Disposed) {
                    // Disposed while the lock was released: detach again.
                    drop(state);
                    log.unsubscribe(sub);
                } else {
                    state.log_subscription = Some(sub);
                    // An append that committed while the lock was released
                    // bypassed the live path. Hand the hole to catch-up.
                    if newest_id(&log)? > tail_before
                        && matches!(state.lifecycle, Lifecycle::Ready { processing: false })
                    {
                        EngineInner::spawn_timer(&self.inner, &mut state)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                state.lifecycle = Lifecycle::FailedInit(e.to_string());
                Err(e)
            }
        }
    }

    fn run_init(&self, state: &mut EngineState) -> Result<CoverageTracker> {
        let store = state.store.as_ref().ok_or(Error::Disposed)?;
        let mut txn = store.begin()?;
        txn.create_table(META)?;
        txn.create_table(AGGREGATES_TABLE)?;

        let stored_version = match txn.get(META, SCHEMA_VERSION_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => 0u32,
        };
        if stored_version < self.inner.config.schema_version {
            (self.inner.upgrade)(
                txn.as_mut(),
                stored_version,
                self.inner.config.schema_version,
            )?;
            // Version advances in the same transaction as the hook, so
            // the hook runs exactly once per persisted-version increase.
            txn.put(
                META,
                SCHEMA_VERSION_KEY,
                &serde_json::to_vec(&self.inner.config.schema_version)?,
            )?;
        }

        let coverage = match txn.get(META, COVERAGE_KEY)? {
            Some(bytes) => {
                let ranges: Vec<CoverageRange> = serde_json::from_slice(&bytes)?;
                CoverageTracker::from_ranges(ranges)
            }
            None => CoverageTracker::new(),
        };
        txn.commit()?;
        Ok(coverage)
    }

    /// Start the periodic catch-up timer. Idempotent while running; the
    /// timer self-terminates once the log is fully covered.
    pub fn start_processing(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        ensure_ready(&state.lifecycle)?;
        if matches!(state.lifecycle, Lifecycle::Ready { processing: true }) {
            return Ok(());
        }
        EngineInner::spawn_timer(&self.inner, &mut state)
    }

    /// Stop the periodic timer. An in-flight tick runs to natural
    /// completion; cancellation is only observed at the tick boundary.
    pub fn stop_processing(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        ensure_ready(&state.lifecycle)?;
        let timer = state.timer.take();
        state.lifecycle = Lifecycle::Ready { processing: false };
        drop(state);
        join_timer(timer);
        Ok(())
    }

    /// Run one catch-up tick synchronously.
    ///
    /// Returns `true` when the log is fully covered (there is nothing
    /// left for the periodic task to do). Exposed for deterministic
    /// drains and tests; the timer calls the same logic.
    pub fn catch_up_once(&self) -> Result<bool> {
        EngineInner::catch_up_tick(&self.inner)
    }

    /// Snapshot of the materialized aggregates for `keys`.
    ///
    /// Keys never touched by a fold map to the configured zero-value
    /// default rather than being omitted. Reads run in their own
    /// transaction and only ever observe committed state.
    pub fn get_aggregated<I, S>(&self, keys: I) -> Result<BTreeMap<String, Value>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let state = self.inner.state.lock();
        ensure_ready(&state.lifecycle)?;
        let store = state.store.as_ref().ok_or(Error::Disposed)?.clone();
        drop(state);

        let txn = store.begin()?;
        let mut result = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            let record = match txn.get(AGGREGATES_TABLE, key.as_bytes())? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => (self.inner.default_record)(key),
            };
            result.insert(key.to_string(), record);
        }
        Ok(result)
    }

    /// Register a listener for post-fold aggregate changes.
    pub fn subscribe(&self, listener: Box<dyn Fn(&AggregateChange) + Send>) -> Result<SubscriptionId> {
        let state = self.inner.state.lock();
        if matches!(state.lifecycle, Lifecycle::Disposed) {
            return Err(Error::Disposed);
        }
        Ok(self.inner.notifier.subscribe(listener))
    }

    /// Remove a change listener. Unknown tokens are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.notifier.unsubscribe(id);
    }

    /// Current lifecycle status.
    pub fn status(&self) -> EngineStatus {
        match &self.inner.state.lock().lifecycle {
            Lifecycle::Uninitialized => EngineStatus::Uninitialized,
            Lifecycle::Initializing => EngineStatus::Initializing,
            Lifecycle::Ready { processing: false } => EngineStatus::Idle,
            Lifecycle::Ready { processing: true } => EngineStatus::Processing,
            Lifecycle::FailedInit(_) => EngineStatus::FailedInit,
            Lifecycle::Disposed => EngineStatus::Disposed,
        }
    }

    /// Currently covered ranges (test and diagnostic aid).
    pub fn coverage(&self) -> Vec<CoverageRange> {
        self.inner.state.lock().coverage.ranges().to_vec()
    }

    /// Tear the engine down. Terminal and idempotent.
    ///
    /// Stops the timer, detaches from the log, clears all change
    /// listeners and releases the storage handle. Every subsequent
    /// operation fails fast with [`Error::Disposed`]; no previously
    /// registered listener fires again.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        if matches!(state.lifecycle, Lifecycle::Disposed) {
            return;
        }
        state.lifecycle = Lifecycle::Disposed;
        let timer = state.timer.take();
        let subscription = state.log_subscription.take();
        let log = state.log.take();
        state.store = None;
        drop(state);

        join_timer(timer);
        if let (Some(log), Some(sub)) = (log, subscription) {
            log.unsubscribe(sub);
        }
        self.inner.notifier.clear();
    }
}

fn ensure_ready(lifecycle: &Lifecycle) -> Result<()> {
    match lifecycle {
        Lifecycle::Ready { .. } => Ok(()),
        Lifecycle::Uninitialized | Lifecycle::Initializing => Err(Error::NotInitialized),
        Lifecycle::FailedInit(msg) => Err(Error::InitFailed(msg.clone())),
        Lifecycle::Disposed => Err(Error::Disposed),
    }
}

fn join_timer(timer: Option<TimerHandle>) {
    if let Some(mut timer) = timer {
        timer.signal.stop();
        if let Some(join) = timer.join.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl EngineInner {
    /// Live path: one transaction = fold + coverage advance for exactly
    /// this event's id. Runs on the appender's thread, after the append
    /// committed.
    fn on_live_event(inner: &Arc<EngineInner>, event: &Event) {
        let mut state = inner.state.lock();
        if !matches!(state.lifecycle, Lifecycle::Ready { .. }) {
            return;
        }
        let Some(store) = state.store.as_ref().cloned() else {
            return;
        };

        let result = (|| -> Result<Option<AggregateChange>> {
            let mut txn = store.begin()?;
            let change = (inner.fold)(txn.as_mut(), event)?;
            if let Some(change) = &change {
                txn.put(
                    AGGREGATES_TABLE,
                    change.key.as_bytes(),
                    &serde_json::to_vec(&change.record)?,
                )?;
            }
            let mut scratch = state.coverage.clone();
            scratch.insert(event.local_id, event.local_id);
            persist_coverage(txn.as_mut(), &scratch)?;
            txn.commit()?;
            state.coverage = scratch;
            Ok(change)
        })();

        match result {
            Ok(change) => {
                drop(state);
                if let Some(change) = change {
                    inner.notifier.emit(std::slice::from_ref(&change));
                }
            }
            Err(e) => {
                // The transaction aborted: no fold effect, no coverage
                // advance. The id stays uncovered and the catch-up path
                // retries it, so make sure the timer is running.
                log::error!(
                    "live fold failed for event {} ({}), deferring to catch-up: {e}",
                    event.local_id,
                    event.global_id
                );
                if matches!(state.lifecycle, Lifecycle::Ready { processing: false }) {
                    if let Err(e) = EngineInner::spawn_timer(inner, &mut state) {
                        log::error!("failed to restart catch-up timer: {e}");
                    }
                }
            }
        }
    }

    fn spawn_timer(
        inner: &Arc<EngineInner>,
        state: &mut parking_lot::MutexGuard<'_, EngineState>,
    ) -> Result<()> {
        let signal = Arc::new(StopSignal::new());
        let weak = Arc::downgrade(inner);
        let thread_signal = Arc::clone(&signal);
        let interval = inner.config.tick_interval;

        let join = thread::Builder::new()
            .name("tallylog-catchup".to_string())
            .spawn(move || timer_loop(weak, thread_signal, interval))?;

        state.lifecycle = Lifecycle::Ready { processing: true };
        state.timer = Some(TimerHandle {
            signal,
            join: Some(join),
        });
        Ok(())
    }

    /// One catch-up tick. Returns `true` when fully covered.
    fn catch_up_tick(inner: &Arc<EngineInner>) -> Result<bool> {
        let mut state = inner.state.lock();
        ensure_ready(&state.lifecycle)?;
        let store = state.store.as_ref().cloned().ok_or(Error::Disposed)?;
        let log = state.log.as_ref().cloned().ok_or(Error::Disposed)?;

        // Fully covered: an empty log counts (nothing to fold), else the
        // coverage must be one origin interval with no records beyond it.
        if !log.exists_any()? {
            return Ok(true);
        }
        if let Some(frontier) = state.coverage.frontier() {
            if state.coverage.is_contiguous_from_origin()
                && log.query_forward(frontier, Some(1))?.is_empty()
            {
                return Ok(true);
            }
        }

        // No interior gap, yet records exist beyond the frontier (the
        // fully-covered probe above would have returned otherwise): a
        // live fold failed on the newest event, or the process stopped
        // between an append's commit and its live fold. Drain that tail
        // hole like the unbounded initial gap, newest record down.
        let gap = state.coverage.find_gap().unwrap_or(Gap {
            start: 0,
            end: None,
        });
        let batch_size = inner.config.batch_size;
        let before = match gap.end {
            Some(end) => end.saturating_add(1),
            None => u64::MAX,
        };
        let events = log.query_backward(before, Some(batch_size))?;

        if events.is_empty() {
            return match gap.end {
                // Nothing has ever been covered and nothing was read; the
                // log may be empty or appear later.
                None => Ok(false),
                // A bounded gap with no surviving records: retention
                // compacted them away. Close the gap instead of stalling
                // forever on deleted data.
                Some(end) => {
                    log::warn!(
                        "events <= {end} were compacted before being folded; closing coverage gap"
                    );
                    let mut scratch = state.coverage.clone();
                    scratch.insert(0, end);
                    let mut txn = store.begin()?;
                    persist_coverage(txn.as_mut(), &scratch)?;
                    txn.commit()?;
                    state.coverage = scratch;
                    Ok(false)
                }
            };
        }

        // One transaction per batch: every fold plus the coverage advance
        // commit together, or nothing does.
        let max_id = events.first().map(|e| e.local_id).unwrap_or(0);
        let min_id = events.last().map(|e| e.local_id).unwrap_or(0);
        let mut txn = store.begin()?;
        let mut changes = Vec::new();
        for event in &events {
            if let Some(change) = (inner.fold)(txn.as_mut(), event)? {
                txn.put(
                    AGGREGATES_TABLE,
                    change.key.as_bytes(),
                    &serde_json::to_vec(&change.record)?,
                )?;
                changes.push(change);
            }
        }

        let mut scratch = state.coverage.clone();
        if events.len() < batch_size {
            // A short read means the scan hit the log's origin: extend
            // coverage all the way down, not merely to the oldest id seen.
            scratch.insert(0, max_id);
        } else {
            scratch.insert(min_id, max_id);
        }
        persist_coverage(txn.as_mut(), &scratch)?;
        txn.commit()?;
        state.coverage = scratch;
        drop(state);

        if !changes.is_empty() {
            inner.notifier.emit(&changes);
        }
        Ok(false)
    }
}

fn persist_coverage(txn: &mut dyn KvTxn, coverage: &CoverageTracker) -> Result<()> {
    txn.put(META, COVERAGE_KEY, &serde_json::to_vec(coverage.ranges())?)
}

/// Newest local id in the log, 0 when empty.
fn newest_id(log: &EventLog) -> Result<u64> {
    Ok(log
        .query_backward(u64::MAX, Some(1))?
        .first()
        .map(|e| e.local_id)
        .unwrap_or(0))
}

/// Periodic catch-up driver. Cancellation (stop signal or engine drop)
/// is checked at each tick boundary; a tick in flight runs to natural
/// completion.
fn timer_loop(inner: Weak<EngineInner>, signal: Arc<StopSignal>, interval: Duration) {
    loop {
        if signal.wait_tick(interval) {
            return;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match EngineInner::catch_up_tick(&inner) {
            Ok(true) => {
                // Fully covered: self-terminate and fall back to Idle.
                let mut state = inner.state.lock();
                if matches!(state.lifecycle, Lifecycle::Ready { .. }) {
                    state.lifecycle = Lifecycle::Ready { processing: false };
                }
                state.timer = None;
                return;
            }
            Ok(false) => {}
            Err(Error::Disposed) => return,
            Err(e) => {
                // The batch aborted as a unit; retry on the next tick.
                log::error!("catch-up tick failed: {e}");
            }
        }
    }
}

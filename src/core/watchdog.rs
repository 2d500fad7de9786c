// src/core/watchdog.rs

//! The timeout watchdog: a registry of in-flight timed operations swept by one
//! background task.
//!
//! Blocking socket calls register an entry holding the socket's closer before
//! they start and mark it succeeded as soon as they return. The sweeper closes
//! the socket of any entry that outlives its budget, which unblocks a hung
//! connect or receive without the operation having to cooperate.
//!
//! The sweeper also watches itself: if callers notice that no sweep has happened
//! for [`STALL_THRESHOLD`] on two consecutive registrations, a fresh sweeper is
//! spawned and the old one retires on its next wake-up.

use crate::core::metrics;
use crate::core::transport::SocketCloser;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the sweeper walks the registry.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
/// Idle time after which a registration counts a stall strike against the sweeper.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(60);
/// Consecutive stall strikes that trigger a respawn.
const STALL_STRIKES: u32 = 2;

/// A source of monotonic time for the watchdog.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// The tokio clock. Honours `tokio::time::pause` in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// One timed operation tracked by the watchdog.
#[derive(Debug)]
pub struct TimeoutEntry {
    id: u64,
    started: Instant,
    /// `None` means the operation has no deadline.
    delay: Option<Duration>,
    succeeded: AtomicBool,
    timed_out: AtomicBool,
    closer: SocketCloser,
}

impl TimeoutEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn is_succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    fn expired_at(&self, now: Instant) -> bool {
        match self.delay {
            Some(delay) => now.saturating_duration_since(self.started) > delay,
            None => false,
        }
    }
}

/// Handle returned by [`TimeoutWatchdog::register`].
///
/// Dropping the guard marks the entry succeeded and takes it out of the
/// registry, so entries never outlive their operation even when no sweeper
/// is running.
#[derive(Debug)]
pub struct TimeoutGuard {
    entry: Arc<TimeoutEntry>,
    registry: Weak<WatchdogInner>,
}

impl TimeoutGuard {
    /// Marks the operation complete. The sweeper drops the entry without
    /// touching the socket.
    pub fn succeed(&self) {
        self.entry.succeeded.store(true, Ordering::Release);
    }

    /// True if the sweeper closed the socket because the deadline passed.
    pub fn is_timed_out(&self) -> bool {
        self.entry.is_timed_out()
    }

    pub fn entry(&self) -> &TimeoutEntry {
        &self.entry
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.succeed();
        if let Some(inner) = self.registry.upgrade() {
            let mut entries = inner.entries.lock();
            if let Some(index) = entries.iter().position(|e| Arc::ptr_eq(e, &self.entry)) {
                entries.swap_remove(index);
            }
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because their operation completed.
    pub completed: usize,
    /// Entries removed because their deadline passed. Their sockets were closed.
    pub expired: usize,
}

struct Sweeper {
    runtime: Handle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct WatchdogInner {
    entries: Mutex<Vec<Arc<TimeoutEntry>>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    last_active: Mutex<Instant>,
    stall_strikes: AtomicU32,
    generation: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

/// The timer service. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct TimeoutWatchdog {
    inner: Arc<WatchdogInner>,
}

impl fmt::Debug for TimeoutWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutWatchdog")
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Default for TimeoutWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutWatchdog {
    /// Creates a stopped watchdog on the tokio clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(WatchdogInner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                clock,
                last_active: Mutex::new(now),
                stall_strikes: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Spawns the sweeper on the current tokio runtime. Calling it on a
    /// running watchdog is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let runtime = Handle::current();
        let stop = CancellationToken::new();
        *self.inner.last_active.lock() = self.inner.clock.now();
        let task = self.spawn_sweeper(&runtime, stop.clone());
        *sweeper = Some(Sweeper {
            runtime,
            stop,
            task,
        });
        info!("Timeout watchdog started.");
    }

    /// Stops the sweeper and waits for it to exit. Pending entries stay
    /// registered and can still be swept manually.
    pub async fn stop(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop.cancel();
            if let Err(e) = sweeper.task.await
                && e.is_panic()
            {
                warn!("Timeout watchdog sweeper panicked: {e:?}");
            }
            info!("Timeout watchdog stopped.");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }

    /// The number of sweepers spawned after the first one.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Number of entries still in the registry.
    pub fn pending(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Registers a timed operation against the socket owning `closer`.
    pub fn register(&self, closer: SocketCloser, delay: Option<Duration>) -> TimeoutGuard {
        self.check_health();
        let entry = Arc::new(TimeoutEntry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            started: self.inner.clock.now(),
            delay,
            succeeded: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            closer,
        });
        if !self.is_running() {
            debug!(
                "Watchdog entry {} registered while no sweeper is running; its deadline is not enforced.",
                entry.id
            );
        }
        self.inner.entries.lock().push(entry.clone());
        TimeoutGuard {
            entry,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Walks the registry once: completed entries are dropped, expired ones are
    /// flagged, have their socket closed, and are dropped.
    pub fn sweep(&self) -> SweepReport {
        let now = self.inner.clock.now();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            entries.retain(|entry| {
                if entry.is_succeeded() {
                    report.completed += 1;
                    false
                } else if entry.expired_at(now) {
                    entry.timed_out.store(true, Ordering::Release);
                    expired.push(entry.clone());
                    false
                } else {
                    true
                }
            });
        }
        report.expired = expired.len();

        // Close outside the registry lock.
        for entry in expired {
            debug!(
                "Watchdog entry {} exceeded {:?}, closing its socket.",
                entry.id, entry.delay
            );
            entry.closer.close();
            metrics::WATCHDOG_EXPIRED_TOTAL.inc();
        }

        *self.inner.last_active.lock() = now;
        report
    }

    fn check_health(&self) {
        let runtime = match self.inner.sweeper.lock().as_ref() {
            Some(sweeper) => sweeper.runtime.clone(),
            None => return,
        };
        let now = self.inner.clock.now();
        let idle = now.saturating_duration_since(*self.inner.last_active.lock());
        if idle <= STALL_THRESHOLD {
            self.inner.stall_strikes.store(0, Ordering::Release);
            return;
        }

        let strikes = self.inner.stall_strikes.fetch_add(1, Ordering::AcqRel) + 1;
        if strikes < STALL_STRIKES {
            return;
        }

        warn!(
            "Timeout watchdog has not swept for {:?}; spawning a replacement sweeper.",
            idle
        );
        self.inner.stall_strikes.store(0, Ordering::Release);
        *self.inner.last_active.lock() = now;
        let mut sweeper = self.inner.sweeper.lock();
        if let Some(current) = sweeper.as_mut() {
            // The old task notices the generation bump and exits on its own.
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            current.task = self.spawn_sweeper(&runtime, current.stop.clone());
        }
    }

    fn spawn_sweeper(&self, runtime: &Handle, stop: CancellationToken) -> JoinHandle<()> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        let weak = Arc::downgrade(&self.inner);
        runtime.spawn(sweep_loop(weak, generation, stop))
    }
}

async fn sweep_loop(inner: Weak<WatchdogInner>, generation: u64, stop: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::Acquire) != generation {
            debug!("Watchdog sweeper generation {generation} superseded, exiting.");
            return;
        }
        TimeoutWatchdog { inner }.sweep();
    }
}

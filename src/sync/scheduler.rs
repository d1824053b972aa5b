//! Phase-aligned periodic execution driven by coordinator snapshots.
//!
//! Every time the assigned offset changes, the current schedule generation
//! is cancelled and a new one is armed: it sleeps until the next wall-clock
//! minute plus the offset, then ticks at the cadence and spawns one action
//! invocation per tick.  Instances sharing an offset therefore fire at the
//! same instant regardless of when their processes started.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coordinator::{Coordinator, SyncConfig, SyncStream};
use super::instance::Instance;
use super::offset::duration_until_next_minute;
use crate::coordination::CoordinationStore;
use crate::metrics::MetricsRegistry;

pub type ActionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Periodic work run on every cadence tick.
///
/// The token is cancelled when the schedule that started the invocation is
/// replaced, when the scheduler shuts down, or when the invocation exceeds
/// its timeout.  Implementations should wind down promptly once it fires.
pub trait Action: Send + Sync + 'static {
    fn run(&self, cancel: CancellationToken) -> ActionFuture;
}

impl<F, Fut> Action for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn run(&self, cancel: CancellationToken) -> ActionFuture {
        Box::pin(self(cancel))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Upper bound on a single action invocation.
    pub action_timeout: Duration,
    /// When non-zero, each generation's start is delayed by a random amount
    /// in `[0, cadence / jitter)`.
    pub jitter: u32,
    /// Seed for the jitter source.  Drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(60),
            jitter: 0,
            seed: None,
        }
    }
}

struct Generation {
    id: u64,
    cancel: CancellationToken,
}

pub struct Scheduler {
    cadence: Duration,
    config: ScheduleConfig,
    action: Arc<dyn Action>,
    rng: StdRng,
    clock: fn() -> DateTime<Utc>,
    metrics: MetricsRegistry,
    last_offset: Option<Duration>,
    active: Option<Generation>,
    generations: u64,
}

impl Scheduler {
    pub fn new(cadence: Duration, config: ScheduleConfig, action: impl Action) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            cadence,
            config,
            action: Arc::new(action),
            rng,
            clock: Utc::now,
            metrics: MetricsRegistry::new(),
            last_offset: None,
            active: None,
            generations: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the wall clock used for minute alignment.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of schedules armed so far.
    pub fn generations(&self) -> u64 {
        self.generations
    }

    /// React to a coordinator snapshot.  Re-arms the schedule when the
    /// offset differs from the last one seen and returns whether it did.
    pub fn observe(&mut self, instance: &Instance, parent: &CancellationToken) -> bool {
        if instance.offset == self.last_offset {
            return false;
        }
        let Some(offset) = instance.offset else {
            return false;
        };

        info!(
            offset_secs = offset.as_secs(),
            count = instance.count,
            position = instance.position,
            instance_id = %instance.id,
            "new offset received"
        );

        self.cancel_active();

        let delay = duration_until_next_minute((self.clock)()) + offset + self.jitter_delay();
        self.generations += 1;
        let generation = Generation {
            id: self.generations,
            cancel: parent.child_token(),
        };

        tokio::spawn(run_generation(
            generation.id,
            delay,
            self.cadence,
            Arc::clone(&self.action),
            self.config.action_timeout,
            generation.cancel.clone(),
            self.metrics.clone(),
        ));

        self.metrics.metrics.schedule_generations.inc();
        self.active = Some(generation);
        self.last_offset = instance.offset;
        true
    }

    /// Consume coordinator snapshots until `cancel` fires or the stream
    /// ends.  Returns the coordinator's error if it gave up.
    pub async fn run(mut self, mut stream: SyncStream, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = stream.recv() => match next {
                    Some(instance) => {
                        self.observe(&instance, &cancel);
                    }
                    None => break,
                },
            }
        }

        self.cancel_active();
        let outcome = stream.finish().await;
        match outcome {
            Ok(()) if !cancel.is_cancelled() => Err(anyhow!("instance stream ended unexpectedly")),
            other => other,
        }
    }

    fn cancel_active(&mut self) {
        if let Some(previous) = self.active.take() {
            // In-flight invocations are told to stop but not awaited.
            debug!(generation = previous.id, "cancelling previous schedule");
            previous.cancel.cancel();
        }
    }

    fn jitter_delay(&mut self) -> Duration {
        if self.config.jitter == 0 {
            return Duration::ZERO;
        }
        let max_ms = (self.cadence / self.config.jitter).as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.random_range(0..max_ms))
    }
}

async fn run_generation(
    id: u64,
    delay: Duration,
    cadence: Duration,
    action: Arc<dyn Action>,
    action_timeout: Duration,
    cancel: CancellationToken,
    metrics: MetricsRegistry,
) {
    info!(generation = id, delay_secs = delay.as_secs_f64(), "sleeping to synchronize");

    tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    info!(generation = id, cadence_secs = cadence.as_secs(), "ticker started");
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(generation = id, "ticker stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        tokio::spawn(invoke(
            id,
            Arc::clone(&action),
            action_timeout,
            cancel.child_token(),
            metrics.clone(),
        ));
    }
}

/// Run one action invocation in its own task so a panic stays contained,
/// bounded by `timeout`.
async fn invoke(
    generation: u64,
    action: Arc<dyn Action>,
    timeout: Duration,
    cancel: CancellationToken,
    metrics: MetricsRegistry,
) {
    let m = &metrics.metrics;
    m.action_invocations.inc();
    let started = tokio::time::Instant::now();

    let handle: JoinHandle<()> = tokio::spawn(action.run(cancel.clone()));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!(generation, "action finished"),
        Ok(Err(e)) if e.is_panic() => {
            m.action_panics.inc();
            error!(generation, error = %e, "action panicked");
        }
        Ok(Err(e)) => warn!(generation, error = %e, "action task aborted"),
        Err(_) => {
            cancel.cancel();
            m.action_timeouts.inc();
            warn!(generation, ?timeout, "action timed out, cancelling");
        }
    }

    m.action_duration_seconds
        .observe(started.elapsed().as_secs_f64());
}

/// Wire a coordinator into a scheduler and run both in the background.
pub fn spawn_staggered(
    coordinator: Coordinator,
    scheduler: Scheduler,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let stream = coordinator.sync(cancel.clone());
        scheduler.run(stream, cancel).await
    })
}

/// Run `action` once per `cadence`, staggered against every other process
/// sharing `store`, with default settings.
pub fn run_staggered(
    store: Arc<dyn CoordinationStore>,
    cadence: Duration,
    action: impl Action,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let coordinator = Coordinator::new(store, cadence, SyncConfig::default())?;
    let scheduler = Scheduler::new(cadence, ScheduleConfig::default(), action);
    Ok(spawn_staggered(coordinator, scheduler, cancel))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::coordination::MemoryStore;

    const MINUTE: Duration = Duration::from_secs(60);

    fn on_minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn instance(offset_secs: u64) -> Instance {
        let mut inst = Instance::new("test:sync:health:a".into(), MINUTE);
        inst.position = 0;
        inst.count = 1;
        inst.offset = Some(Duration::from_secs(offset_secs));
        inst
    }

    fn noop(_cancel: CancellationToken) -> impl Future<Output = ()> + Send {
        async {}
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_offsets_arm_once() {
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(MINUTE, ScheduleConfig::default(), noop);

        let armed: Vec<bool> = [20, 20, 20, 20]
            .iter()
            .map(|&o| scheduler.observe(&instance(o), &cancel))
            .collect();

        assert_eq!(armed, vec![true, false, false, false]);
        assert_eq!(scheduler.generations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offset_change_rearms_and_cancels_previous() {
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(MINUTE, ScheduleConfig::default(), noop);

        scheduler.observe(&instance(0), &cancel);
        let first = scheduler.active.as_ref().unwrap().cancel.clone();

        scheduler.observe(&instance(0), &cancel);
        scheduler.observe(&instance(30), &cancel);
        let second = scheduler.active.as_ref().unwrap().cancel.clone();

        assert_eq!(scheduler.generations(), 2);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_offset_is_ignored() {
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(MINUTE, ScheduleConfig::default(), noop);

        let unranked = Instance::new("a".into(), MINUTE);
        assert!(!scheduler.observe(&unranked, &cancel));
        assert_eq!(scheduler.generations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_minute_plus_offset_then_every_cadence() {
        let start = tokio::time::Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let action = {
            let fired = Arc::clone(&fired);
            move |_cancel: CancellationToken| {
                let fired = Arc::clone(&fired);
                async move {
                    fired.lock().unwrap().push(start.elapsed().as_secs());
                }
            }
        };

        let cancel = CancellationToken::new();
        let mut scheduler =
            Scheduler::new(MINUTE, ScheduleConfig::default(), action).with_clock(on_minute);
        scheduler.observe(&instance(20), &cancel);

        tokio::time::sleep(Duration::from_secs(170)).await;
        assert_eq!(*fired.lock().unwrap(), vec![80, 140]);

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_action_is_cancelled_after_timeout() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let action = {
            let saw_cancel = Arc::clone(&saw_cancel);
            move |cancel: CancellationToken| {
                let saw_cancel = Arc::clone(&saw_cancel);
                async move {
                    cancel.cancelled().await;
                    saw_cancel.store(true, Ordering::SeqCst);
                }
            }
        };

        let metrics = MetricsRegistry::new();
        let config = ScheduleConfig {
            action_timeout: Duration::from_secs(5),
            ..ScheduleConfig::default()
        };
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(MINUTE, config, action)
            .with_clock(on_minute)
            .with_metrics(metrics.clone());
        scheduler.observe(&instance(0), &cancel);

        // First invocation at 60s, times out at 65s.
        tokio::time::sleep(Duration::from_secs(66)).await;
        assert!(saw_cancel.load(Ordering::SeqCst));
        assert_eq!(metrics.metrics.action_timeouts.get(), 1);
        assert_eq!(metrics.metrics.action_invocations.get(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_action_does_not_stop_ticker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = {
            let calls = Arc::clone(&calls);
            move |_cancel: CancellationToken| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    panic!("scrape failed");
                }
            }
        };

        let metrics = MetricsRegistry::new();
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(MINUTE, ScheduleConfig::default(), action)
            .with_clock(on_minute)
            .with_metrics(metrics.clone());
        scheduler.observe(&instance(0), &cancel);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.metrics.action_panics.get(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_jitter_is_bounded_and_repeatable() {
        let config = ScheduleConfig {
            jitter: 4,
            seed: Some(9),
            ..ScheduleConfig::default()
        };
        let mut a = Scheduler::new(MINUTE, config.clone(), noop);
        let mut b = Scheduler::new(MINUTE, config, noop);
        for _ in 0..20 {
            let delay = a.jitter_delay();
            assert!(delay < Duration::from_secs(15));
            assert_eq!(delay, b.jitter_delay());
        }

        let mut none = Scheduler::new(MINUTE, ScheduleConfig::default(), noop);
        assert_eq!(none.jitter_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_runs_until_cancelled() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let action = {
            let calls = Arc::clone(&calls);
            move |_cancel: CancellationToken| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let cancel = CancellationToken::new();
        let handle = run_staggered(store, MINUTE, action, cancel.clone()).unwrap();

        // Up to 60s to the next wall-clock minute, then one tick per minute.
        tokio::time::sleep(Duration::from_secs(185)).await;
        let fired = calls.load(Ordering::SeqCst);
        assert!((3..=4).contains(&fired), "fired {fired} times");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}

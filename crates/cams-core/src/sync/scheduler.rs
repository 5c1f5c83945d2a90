//! Debounced, rate-limited save scheduling
//!
//! Bursts of save requests collapse into one write of the latest value.
//! A write fires after a quiet period with no new requests. While a write
//! is in flight, new requests only mark the latest value as pending. After
//! every write a cooldown begins; requests arriving during it are held and
//! a single catch-up write fires when it ends. At most one write runs at a
//! time.
//!
//! The scheduler is a task driven by a command channel. Dropping the
//! handle stops it; anything still pending is discarded, so callers that
//! are about to exit should `flush` first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::remote::RemoteStoreClient;
use super::session::Session;
use crate::models::RecordSet;

/// Timing for a coalescing scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Quiet period before a scheduled write fires
    pub quiet_period: Duration,
    /// Minimum time between the end of a write and the next one
    pub cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1500),
            cooldown: Duration::from_millis(3000),
        }
    }
}

type Job<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command<T> {
    Schedule(T),
    Flush(oneshot::Sender<()>),
    Cancel,
}

/// Handle to a coalescing scheduler task
pub struct CoalescingScheduler<T> {
    command_tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Send + 'static> CoalescingScheduler<T> {
    /// Start the scheduler task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(config: SchedulerConfig, job: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let job: Job<T> = Arc::new(move |value| job(value).boxed());

        let task = SchedulerTask {
            config,
            job,
            command_rx,
            latest: None,
            waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        Self { command_tx }
    }

    /// Request a write of `value`, replacing any value still pending
    pub fn schedule(&self, value: T) {
        if self.command_tx.send(Command::Schedule(value)).is_err() {
            warn!("Save scheduler stopped, request dropped");
        }
    }

    /// Write any pending value now and wait until no write is outstanding
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Discard the pending value; a write in flight still completes
    pub fn cancel(&self) {
        let _ = self.command_tx.send(Command::Cancel);
    }
}

struct SchedulerTask<T> {
    config: SchedulerConfig,
    job: Job<T>,
    command_rx: mpsc::UnboundedReceiver<Command<T>>,
    /// Latest value not yet handed to a write
    latest: Option<T>,
    /// Flush callers to notify once nothing is outstanding
    waiters: Vec<oneshot::Sender<()>>,
}

/// Whether the task should keep running
enum Flow {
    Continue,
    Stop,
}

impl<T: Send + 'static> SchedulerTask<T> {
    async fn run(mut self) {
        loop {
            // Idle until the first request
            match self.command_rx.recv().await {
                Some(Command::Schedule(value)) => self.latest = Some(value),
                Some(Command::Flush(done)) => {
                    let _ = done.send(());
                    continue;
                }
                Some(Command::Cancel) => continue,
                None => break,
            }

            if let Flow::Stop = self.debounce().await {
                break;
            }

            if let Flow::Stop = self.drain().await {
                break;
            }

            self.notify_waiters();
        }

        if self.latest.is_some() {
            debug!("Save scheduler stopped with a pending write");
        }
        self.notify_waiters();
    }

    /// Wait for the quiet period; every new request restarts it
    async fn debounce(&mut self) -> Flow {
        let mut deadline = Instant::now() + self.config.quiet_period;
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Schedule(value)) => {
                        self.latest = Some(value);
                        deadline = Instant::now() + self.config.quiet_period;
                    }
                    Some(Command::Flush(done)) => {
                        self.waiters.push(done);
                        return Flow::Continue;
                    }
                    Some(Command::Cancel) => {
                        self.latest = None;
                        return Flow::Continue;
                    }
                    None => return Flow::Stop,
                },
                () = sleep_until(deadline) => return Flow::Continue,
            }
        }
    }

    /// Write until nothing is pending, honoring the cooldown between writes
    async fn drain(&mut self) -> Flow {
        while let Some(value) = self.latest.take() {
            if let Flow::Stop = self.execute(value).await {
                return Flow::Stop;
            }

            // A flush arrived while a newer value was pending: write it now
            if self.latest.is_some() && !self.waiters.is_empty() {
                continue;
            }
            self.notify_waiters();

            if let Flow::Stop = self.cooldown().await {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Run one write; requests arriving meanwhile only update `latest`
    async fn execute(&mut self, value: T) -> Flow {
        let mut write = (self.job)(value);
        let mut flow = Flow::Continue;
        let mut closed = false;

        loop {
            tokio::select! {
                () = &mut write => break,
                command = self.command_rx.recv(), if !closed => match command {
                    Some(Command::Schedule(value)) => self.latest = Some(value),
                    Some(Command::Flush(done)) => self.waiters.push(done),
                    Some(Command::Cancel) => self.latest = None,
                    None => {
                        // Let the in-flight write finish before stopping
                        closed = true;
                        flow = Flow::Stop;
                    }
                },
            }
        }
        flow
    }

    /// Hold requests until the cooldown ends
    async fn cooldown(&mut self) -> Flow {
        let until = Instant::now() + self.config.cooldown;
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Schedule(value)) => self.latest = Some(value),
                    Some(Command::Flush(done)) => {
                        if self.latest.is_some() {
                            self.waiters.push(done);
                            return Flow::Continue;
                        }
                        let _ = done.send(());
                    }
                    Some(Command::Cancel) => self.latest = None,
                    None => return Flow::Stop,
                },
                () = sleep_until(until) => return Flow::Continue,
            }
        }
    }

    fn notify_waiters(&mut self) {
        for done in self.waiters.drain(..) {
            let _ = done.send(());
        }
    }
}

/// A save waiting in the scheduler
pub struct SaveRequest {
    records: RecordSet,
    /// Session generation at the time the save was requested
    generation: u64,
}

/// Schedules remote saves of the catalog
///
/// Each request is stamped with the session generation. A save whose
/// session has since been cleared or superseded by a merge is dropped
/// when it comes up for writing.
pub struct SaveScheduler {
    inner: CoalescingScheduler<SaveRequest>,
    session: Session,
}

impl SaveScheduler {
    pub fn spawn(config: SchedulerConfig, remote: Arc<RemoteStoreClient>, session: Session) -> Self {
        let inner = CoalescingScheduler::spawn(config, move |request: SaveRequest| {
            let remote = remote.clone();
            async move {
                match remote.save(request.generation, &request.records).await {
                    Ok(handle) => info!(
                        file_id = %handle.id,
                        records = request.records.len(),
                        "Saved catalog to remote"
                    ),
                    Err(SyncError::SessionEnded) => {
                        debug!(generation = request.generation, "Dropped save from an ended session")
                    }
                    Err(e) => warn!(error = %e, "Remote save failed"),
                }
            }
        });
        Self { inner, session }
    }

    /// Request a remote save of `records`
    ///
    /// Ignored (returns false) while the session is not connected.
    pub fn schedule_save(&self, records: RecordSet) -> bool {
        let Some(generation) = self.session.current_generation() else {
            debug!("Not connected, save not scheduled");
            return false;
        };
        self.inner.schedule(SaveRequest {
            records,
            generation,
        });
        true
    }

    /// Write any pending save now and wait for it
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Drop any pending save
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::models::{Record, RecordId};
    use crate::sync::session::AccessToken;
    use crate::sync::testing::MemoryRemote;

    /// Records (value, start time) of every write
    #[derive(Clone, Default)]
    struct Recorder {
        writes: Arc<Mutex<Vec<(u32, Instant)>>>,
    }

    impl Recorder {
        fn scheduler(&self, config: SchedulerConfig, write_time: Duration) -> CoalescingScheduler<u32> {
            let writes = self.writes.clone();
            CoalescingScheduler::spawn(config, move |value| {
                let writes = writes.clone();
                async move {
                    writes.lock().unwrap().push((value, Instant::now()));
                    tokio::time::sleep(write_time).await;
                }
            })
        }

        fn values(&self) -> Vec<u32> {
            self.writes.lock().unwrap().iter().map(|(v, _)| *v).collect()
        }

        fn times(&self) -> Vec<Instant> {
            self.writes.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            quiet_period: Duration::from_millis(1500),
            cooldown: Duration::from_millis(3000),
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_write() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));

        for value in 1..=5 {
            scheduler.schedule(value);
            advance(100).await;
        }
        advance(2000).await;

        assert_eq!(recorder.values(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_quiet_period() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));
        let start = Instant::now();

        scheduler.schedule(1);
        advance(1000).await;
        assert!(recorder.values().is_empty());
        scheduler.schedule(2);
        advance(3000).await;

        assert_eq!(recorder.values(), vec![2]);
        assert!(recorder.times()[0] >= start + Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_bursts_within_quiet_period_write_once() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));

        scheduler.schedule(1);
        scheduler.schedule(2);
        advance(1000).await;
        scheduler.schedule(3);
        scheduler.schedule(4);
        advance(5000).await;

        assert_eq!(recorder.values(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_write_is_caught_up_once() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(1000));

        scheduler.schedule(1);
        advance(1600).await;
        assert_eq!(recorder.values(), vec![1]);

        // Write in flight: these only mark a pending value
        scheduler.schedule(2);
        scheduler.schedule(3);
        advance(10_000).await;

        assert_eq!(recorder.values(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_writes() {
        let recorder = Recorder::default();
        let write_time = Duration::from_millis(200);
        let scheduler = recorder.scheduler(config(), write_time);

        scheduler.schedule(1);
        advance(1800).await;
        // During the cooldown after the first write
        scheduler.schedule(2);
        advance(500).await;
        scheduler.schedule(3);
        advance(10_000).await;

        assert_eq!(recorder.values(), vec![1, 3]);
        let times = recorder.times();
        assert!(times[1] >= times[0] + write_time + Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_burst_inside_cooldown_writes_once() {
        let recorder = Recorder::default();
        let write_time = Duration::from_millis(100);
        let scheduler = recorder.scheduler(config(), write_time);

        scheduler.schedule(1);
        scheduler.schedule(2);
        advance(2000).await;
        assert_eq!(recorder.values(), vec![2]);

        // Second burst lands inside the cooldown after the first write
        scheduler.schedule(3);
        advance(300).await;
        scheduler.schedule(4);
        advance(300).await;
        scheduler.schedule(5);
        advance(10_000).await;

        assert_eq!(recorder.values(), vec![2, 5]);
        let times = recorder.times();
        assert!(times[1] >= times[0] + write_time + Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));
        let start = Instant::now();

        scheduler.schedule(7);
        scheduler.flush().await;

        assert_eq!(recorder.values(), vec![7]);
        assert!(recorder.times()[0] < start + Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_includes_value_pending_during_write() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(1000));

        scheduler.schedule(1);
        advance(1600).await;
        scheduler.schedule(2);
        scheduler.flush().await;

        assert_eq!(recorder.values(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_when_idle_returns() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));

        scheduler.flush().await;
        assert!(recorder.values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let recorder = Recorder::default();
        let scheduler = recorder.scheduler(config(), Duration::from_millis(100));

        scheduler.schedule(1);
        advance(500).await;
        scheduler.cancel();
        advance(5000).await;

        assert!(recorder.values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_write_at_a_time() {
        let active = Arc::new(Mutex::new((0usize, 0usize)));
        let tracker = active.clone();
        let scheduler = CoalescingScheduler::spawn(
            SchedulerConfig {
                quiet_period: Duration::from_millis(10),
                cooldown: Duration::ZERO,
            },
            move |_: u32| {
                let tracker = tracker.clone();
                async move {
                    {
                        let mut guard = tracker.lock().unwrap();
                        guard.0 += 1;
                        guard.1 = guard.1.max(guard.0);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    tracker.lock().unwrap().0 -= 1;
                }
            },
        );

        for value in 0..20 {
            scheduler.schedule(value);
            advance(15).await;
        }
        scheduler.flush().await;

        assert_eq!(active.lock().unwrap().1, 1);
    }

    fn records(english: &str) -> RecordSet {
        RecordSet::from_records(vec![Record::with_id(
            RecordId::from_millis(1),
            english,
            "",
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_scheduler_ignores_disconnected() {
        let remote = Arc::new(MemoryRemote::new());
        let session = Session::new();
        let client = Arc::new(RemoteStoreClient::new(
            remote.clone(),
            session.clone(),
            "data.json",
        ));
        let scheduler = SaveScheduler::spawn(config(), client, session);

        assert!(!scheduler.schedule_save(records("A")));
        scheduler.flush().await;
        assert_eq!(remote.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_scheduler_writes_latest() {
        let remote = Arc::new(MemoryRemote::new());
        let session = Session::new();
        session.establish(AccessToken::new("tok", None));
        let client = Arc::new(RemoteStoreClient::new(
            remote.clone(),
            session.clone(),
            "data.json",
        ));
        let scheduler = SaveScheduler::spawn(config(), client, session);

        assert!(scheduler.schedule_save(records("A")));
        assert!(scheduler.schedule_save(records("B")));
        advance(2000).await;

        assert_eq!(remote.write_calls(), 1);
        let id = remote.file_ids().pop().unwrap();
        let saved = remote.records(&id).unwrap();
        assert_eq!(saved.iter().next().unwrap().english, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_from_ended_session_is_dropped() {
        let remote = Arc::new(MemoryRemote::new());
        let session = Session::new();
        session.establish(AccessToken::new("tok", None));
        let client = Arc::new(RemoteStoreClient::new(
            remote.clone(),
            session.clone(),
            "data.json",
        ));
        let scheduler = SaveScheduler::spawn(config(), client, session.clone());

        assert!(scheduler.schedule_save(records("A")));
        session.clear();
        session.establish(AccessToken::new("other", None));
        advance(2000).await;

        assert_eq!(remote.write_calls(), 0);
        assert_eq!(remote.list_calls(), 0);
    }
}

//! Outbound send queue
//!
//! One pending slot, not a FIFO: a newer message overwrites an older one that
//! has not been written yet, so a slider dragged across its range produces a
//! handful of writes carrying the latest positions instead of a backlog.
//! Callers sending discrete events (button press, then release) must space
//! them by at least the minimum interval or the first one may be superseded.
//!
//! A single worker task owns the sink. It never starts a write while another
//! is in flight and leaves at least `min_interval` between the starts of two
//! consecutive writes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, warn};

use crate::WriteError;

/// Something that can carry one protocol line to the device.
pub trait LineSink: Send + Sync + 'static {
    /// Write `line` plus its terminator. Resolves once the transport has
    /// accepted every chunk.
    fn write_line(&self, line: &str) -> impl Future<Output = Result<(), WriteError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub min_interval: Duration,
    /// Consecutive failed writes before the owner is told
    pub max_retries: u32,
    pub write_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            max_retries: 3,
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: Option<String>,
    pub writing: bool,
    pub retry_count: u32,
}

/// Things the owner of the queue has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
    /// A write reported the link gone. The queue has already reset itself.
    Disconnected(WriteError),
    /// `max_retries` writes in a row failed; `line` was the last of them.
    RetriesExhausted { line: String, error: WriteError },
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<String>,
    writing: bool,
    last_sent: Option<Instant>,
    retry_count: u32,
    /// Bumped by every reset, so a write that straddles a reset cannot touch
    /// the fresh state.
    epoch: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Notify,
    idle: Notify,
}

enum Next {
    Write { line: String, epoch: u64 },
    Wait(Instant),
    Idle,
    Closed,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot holds plain data, a panic elsewhere cannot leave it torn.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next(&self, min_interval: Duration) -> Next {
        let mut slot = self.lock();
        if slot.closed {
            return Next::Closed;
        }
        if slot.pending.is_none() {
            return Next::Idle;
        }
        if let Some(last) = slot.last_sent {
            let ready_at = last + min_interval;
            if Instant::now() < ready_at {
                return Next::Wait(ready_at);
            }
        }
        match slot.pending.take() {
            Some(line) => {
                slot.writing = true;
                Next::Write { line, epoch: slot.epoch }
            }
            None => Next::Idle,
        }
    }

    fn complete(
        &self,
        line: String,
        epoch: u64,
        result: Result<(), WriteError>,
        max_retries: u32,
    ) -> Option<QueueNotice> {
        let mut slot = self.lock();
        if slot.epoch != epoch {
            debug!(%line, "write finished after reset, result ignored");
            return None;
        }
        slot.writing = false;

        match result {
            Ok(()) => {
                slot.last_sent = Some(Instant::now());
                slot.retry_count = 0;
                None
            }
            Err(error) if error.is_disconnect() => {
                reset_slot(&mut slot);
                Some(QueueNotice::Disconnected(error))
            }
            // At most once: a failed or timed-out line is never sent again.
            Err(error) => {
                slot.retry_count += 1;
                if slot.retry_count >= max_retries {
                    warn!(%line, %error, failures = slot.retry_count, "writes keep failing");
                    slot.retry_count = 0;
                    return Some(QueueNotice::RetriesExhausted { line, error });
                }
                debug!(%line, %error, failures = slot.retry_count, "write failed, message dropped");
                None
            }
        }
    }

    fn is_flushed(&self) -> bool {
        let slot = self.lock();
        slot.closed || (slot.pending.is_none() && !slot.writing)
    }
}

fn reset_slot(slot: &mut Slot) {
    slot.pending = None;
    slot.writing = false;
    slot.last_sent = None;
    slot.retry_count = 0;
    slot.epoch += 1;
}

/// Handle to the queue. Cheap to clone; the worker runs until `close`.
#[derive(Debug, Clone)]
pub struct SendQueue {
    shared: Arc<Shared>,
}

impl SendQueue {
    /// Start the worker on the current tokio runtime.
    pub fn spawn<S: LineSink>(
        sink: S,
        settings: QueueSettings,
    ) -> (Self, mpsc::UnboundedReceiver<QueueNotice>) {
        let shared = Arc::new(Shared::default());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(sink, Arc::clone(&shared), settings, notice_tx));
        (Self { shared }, notice_rx)
    }

    /// Queue `message`, replacing whatever was still waiting. Returns false
    /// when the message is empty after trimming or the queue is closed.
    pub fn send(&self, message: &str) -> bool {
        let Some(line) = sanitize(message) else {
            return false;
        };
        {
            let mut slot = self.shared.lock();
            if slot.closed {
                return false;
            }
            if let Some(previous) = slot.pending.replace(line) {
                debug!(%previous, "superseded");
            }
        }
        self.shared.wake.notify_one();
        true
    }

    /// Drop the pending message and release the in-flight flag.
    pub fn reset(&self) {
        reset_slot(&mut self.shared.lock());
        self.shared.wake.notify_one();
        self.shared.idle.notify_waiters();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let slot = self.shared.lock();
        QueueSnapshot {
            pending: slot.pending.clone(),
            writing: slot.writing,
            retry_count: slot.retry_count,
        }
    }

    /// Stop the worker. A write already in flight is allowed to finish.
    pub fn close(&self) {
        {
            let mut slot = self.shared.lock();
            slot.closed = true;
            slot.pending = None;
        }
        self.shared.wake.notify_one();
        self.shared.idle.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Wait until nothing is pending or in flight.
    pub async fn flushed(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.is_flushed() {
                return;
            }
            notified.await;
        }
    }

    /// `flushed` with an upper bound. Returns false on timeout.
    pub async fn flush(&self, limit: Duration) -> bool {
        timeout(limit, self.flushed()).await.is_ok()
    }
}

/// Strip line terminators and surrounding whitespace; a message must not
/// smuggle a second line onto the wire.
fn sanitize(message: &str) -> Option<String> {
    let line: String = message.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let line = line.trim();
    if line.is_empty() { None } else { Some(line.to_string()) }
}

async fn run<S: LineSink>(
    sink: S,
    shared: Arc<Shared>,
    settings: QueueSettings,
    notices: mpsc::UnboundedSender<QueueNotice>,
) {
    loop {
        match shared.next(settings.min_interval) {
            Next::Closed => break,
            Next::Idle => shared.wake.notified().await,
            Next::Wait(until) => {
                tokio::select! {
                    _ = sleep_until(until) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            Next::Write { line, epoch } => {
                debug!(%line, "write");
                let result = match timeout(settings.write_timeout, sink.write_line(&line)).await {
                    Ok(result) => result,
                    Err(_) => Err(WriteError::Timeout(settings.write_timeout)),
                };
                if let Some(notice) = shared.complete(line, epoch, result, settings.max_retries) {
                    let _ = notices.send(notice);
                }
                shared.idle.notify_waiters();
            }
        }
    }
    debug!("send queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records every write with the (paused) time it started.
    #[derive(Clone, Default)]
    struct Recorder {
        writes: Arc<Mutex<Vec<(Instant, String)>>>,
        /// Results handed out before falling back to Ok
        script: Arc<Mutex<Vec<Result<(), WriteError>>>>,
        delay: Duration,
        in_flight: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn failing(results: Vec<Result<(), WriteError>>) -> Self {
            Self { script: Arc::new(Mutex::new(results)), ..Self::default() }
        }

        fn lines(&self) -> Vec<String> {
            self.writes.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
        }

        fn times(&self) -> Vec<Instant> {
            self.writes.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    impl LineSink for Recorder {
        async fn write_line(&self, line: &str) -> Result<(), WriteError> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.writes.lock().unwrap().push((Instant::now(), line.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.store(false, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() { Ok(()) } else { script.remove(0) }
        }
    }

    /// Never completes.
    #[derive(Clone, Default)]
    struct Hung {
        attempts: Arc<AtomicUsize>,
    }

    impl LineSink for Hung {
        async fn write_line(&self, _line: &str) -> Result<(), WriteError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_sends_coalesce_to_the_last() {
        let sink = Recorder::default();
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        assert!(queue.send("SET sld1 10"));
        assert!(queue.send("SET sld1 20"));
        assert!(queue.send("SET sld1 30"));
        assert!(queue.flush(Duration::from_secs(1)).await);

        assert_eq!(sink.lines(), vec!["SET sld1 30"]);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_respect_min_interval() {
        let sink = Recorder::default();
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        for i in 0..5 {
            queue.send(&format!("SET sld1 {i}"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(queue.flush(Duration::from_secs(2)).await);

        let times = sink.times();
        assert!(times.len() >= 2);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(sink.lines().last().map(String::as_str), Some("SET sld1 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_two_writes_in_flight() {
        let sink = Recorder { delay: Duration::from_millis(350), ..Recorder::default() };
        let settings = QueueSettings { min_interval: Duration::ZERO, ..QueueSettings::default() };
        let (queue, _notices) = SendQueue::spawn(sink.clone(), settings);

        let mut tasks = Vec::new();
        for task in 0..4 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    queue.send(&format!("SET joy1 {task} {i}"));
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(queue.flush(Duration::from_secs(5)).await);

        assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
        assert!(sink.lines().len() < 40);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_and_queue_stays_usable() {
        let sink = Recorder::failing(vec![Err(WriteError::Disconnected("gone".into()))]);
        let (queue, mut notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        queue.send("SET btn1 1");
        assert_eq!(
            notices.recv().await,
            Some(QueueNotice::Disconnected(WriteError::Disconnected("gone".into())))
        );
        assert_eq!(
            queue.snapshot(),
            QueueSnapshot { pending: None, writing: false, retry_count: 0 }
        );

        // last_sent was cleared, so this goes out without waiting.
        let before = Instant::now();
        queue.send("GETCFG");
        assert!(queue.flush(Duration::from_secs(1)).await);
        assert_eq!(sink.lines(), vec!["SET btn1 1", "GETCFG"]);
        assert!(sink.times()[1] - before < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_not_sent_again() {
        let sink = Recorder::failing(vec![Err(WriteError::Transient("busy".into()))]);
        let (queue, mut notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        queue.send("SET tgl1 1");
        assert!(queue.flush(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sink.lines(), vec!["SET tgl1 1"]);
        assert_eq!(
            queue.snapshot(),
            QueueSnapshot { pending: None, writing: false, retry_count: 1 }
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_are_reported() {
        let failure = WriteError::Transient("busy".into());
        let sink = Recorder::failing(vec![Err(failure.clone()), Err(failure.clone()), Err(failure.clone())]);
        let (queue, mut notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        for line in ["SET tgl1 1", "SET tgl1 0", "SET tgl1 1"] {
            queue.send(line);
            assert!(queue.flush(Duration::from_secs(1)).await);
        }
        assert_eq!(
            notices.recv().await,
            Some(QueueNotice::RetriesExhausted { line: "SET tgl1 1".into(), error: failure })
        );
        assert_eq!(sink.lines(), vec!["SET tgl1 1", "SET tgl1 0", "SET tgl1 1"]);
        assert_eq!(queue.snapshot().retry_count, 0);

        queue.send("SET tgl1 0");
        assert!(queue.flush(Duration::from_secs(1)).await);
        assert_eq!(sink.lines().len(), 4);
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_message_replaces_a_failed_one() {
        let sink = Recorder {
            script: Arc::new(Mutex::new(vec![Err(WriteError::Transient("busy".into()))])),
            delay: Duration::from_millis(10),
            ..Recorder::default()
        };
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        queue.send("SET sld1 1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.send("SET sld1 2");
        assert!(queue.flush(Duration::from_secs(1)).await);

        assert_eq!(sink.lines(), vec!["SET sld1 1", "SET sld1 2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_write_times_out_and_releases() {
        let sink = Hung::default();
        let settings = QueueSettings { max_retries: 1, ..QueueSettings::default() };
        let (queue, mut notices) = SendQueue::spawn(sink.clone(), settings);

        queue.send("GETCFG");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.snapshot().writing);

        let notice = notices.recv().await;
        assert_eq!(
            notice,
            Some(QueueNotice::RetriesExhausted {
                line: "GETCFG".into(),
                error: WriteError::Timeout(Duration::from_secs(2)),
            })
        );
        assert!(!queue.snapshot().writing);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_line_is_written_once() {
        let sink = Hung::default();
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        queue.send("SET btn1 1");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.snapshot(),
            QueueSnapshot { pending: None, writing: false, retry_count: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn joystick_release_follows_push() {
        let sink = Recorder::default();
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        queue.send("SET joy1 180 50");
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send("SET joy1 0 0");
        assert!(queue.flush(Duration::from_secs(1)).await);

        let times = sink.times();
        assert_eq!(sink.lines(), vec!["SET joy1 180 50", "SET joy1 0 0"]);
        assert!(times[1] - times[0] >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn sanitizes_and_rejects() {
        let sink = Recorder::default();
        let (queue, _notices) = SendQueue::spawn(sink.clone(), QueueSettings::default());

        assert!(!queue.send("  \r\n"));
        assert!(queue.send(" SET txt1 hi\r\n"));
        assert!(queue.flush(Duration::from_secs(1)).await);
        assert_eq!(sink.lines(), vec!["SET txt1 hi"]);

        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.send("GETCFG"));
    }
}

//! A protocol session over one connection
//!
//! Inbound bytes go through a [`LineBuffer`] and a [`Decoder`] on a single
//! task, so lines are handled strictly in arrival order. Outbound lines go
//! through a [`SendQueue`]. Everything the application needs to know comes
//! out of the event channel returned by [`Session::start`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bitremote_proto::line::GETCFG;
use bitremote_proto::{
    Config, ConfigDecodeError, Decoded, Decoder, Event, Line, LineBuffer, Progress,
};

use crate::queue::{LineSink, QueueNotice, QueueSnapshot, SendQueue};
use crate::{Settings, WriteError};

#[derive(Debug)]
pub enum SessionEvent {
    Config(Config),
    /// The transfer completed but did not decode. The session stays usable.
    ConfigError(ConfigDecodeError),
    Update(Event),
    /// A config transfer advanced.
    Progress(Progress),
    /// A message was dropped after repeated write failures.
    SendFailed { line: String, error: WriteError },
    /// The link is gone. `error` is the write failure that revealed it, if
    /// it was not the inbound stream ending.
    Disconnected { error: Option<WriteError> },
}

#[derive(Debug)]
struct RxState {
    buffer: LineBuffer,
    decoder: Decoder,
}

#[derive(Debug)]
struct Shared {
    rx: Mutex<RxState>,
    values: Mutex<HashMap<String, String>>,
    config: Mutex<Option<Config>>,
    connected: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn clear_rx(&self) {
        let mut rx = lock(&self.rx);
        rx.buffer.clear();
        rx.decoder.reset();
    }

    fn receive(&self, fragment: &[u8], events: &mpsc::UnboundedSender<SessionEvent>) {
        let mut rx = lock(&self.rx);
        let RxState { buffer, decoder } = &mut *rx;

        for line in buffer.feed(fragment) {
            let event = match decoder.handle_line(&line) {
                Some(Decoded::Config(config)) => {
                    info!(title = %config.title, widgets = config.widgets.len(), "config received");
                    *lock(&self.config) = Some(config.clone());
                    SessionEvent::Config(config)
                }
                Some(Decoded::ConfigError(err)) => {
                    warn!(error = %err, "config transfer failed");
                    SessionEvent::ConfigError(err)
                }
                Some(Decoded::Update(event)) => {
                    lock(&self.values).insert(event.id.clone(), event.value.clone());
                    SessionEvent::Update(event)
                }
                Some(Decoded::Set(event)) => {
                    debug!(id = %event.id, "ignoring SET from device");
                    continue;
                }
                Some(Decoded::ConfigRequest) => {
                    debug!("ignoring GETCFG from device");
                    continue;
                }
                None => match decoder.progress() {
                    Some(progress) => SessionEvent::Progress(progress),
                    None => continue,
                },
            };
            let _ = events.send(event);
        }
    }

    fn disconnected(&self, queue: &SendQueue, events: &mpsc::UnboundedSender<SessionEvent>, error: Option<WriteError>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(err) => warn!(error = %err, "disconnected"),
            None => info!("disconnected"),
        }
        self.clear_rx();
        queue.reset();
        queue.close();
        let _ = events.send(SessionEvent::Disconnected { error });
    }
}

/// Handle to a running session. Dropping it stops the session.
#[derive(Debug)]
pub struct Session {
    queue: SendQueue,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
    getcfg_delay: Duration,
}

impl Session {
    /// Wire `sink` and `inbound` together. Must be called inside a tokio
    /// runtime.
    pub fn start<S, I>(sink: S, inbound: I, settings: &Settings) -> (Self, mpsc::UnboundedReceiver<SessionEvent>)
    where
        S: LineSink,
        I: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
    {
        let (queue, notices) = SendQueue::spawn(sink, settings.queue_settings());
        let shared = Arc::new(Shared {
            rx: Mutex::new(RxState {
                buffer: LineBuffer::with_max_line_len(settings.max_line_len),
                decoder: Decoder::new(),
            }),
            values: Mutex::new(HashMap::new()),
            config: Mutex::new(None),
            connected: AtomicBool::new(true),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(inbound, notices, queue.clone(), Arc::clone(&shared), events_tx));

        let session = Self { queue, shared, task, getcfg_delay: settings.getcfg_delay() };
        (session, events_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Queue a raw line. Returns false if it was rejected.
    pub fn send(&self, line: &str) -> bool {
        if !self.is_connected() {
            debug!(%line, "not connected, dropping");
            return false;
        }
        self.queue.send(line)
    }

    /// `SET <id> <value>`. The id must be a single token.
    pub fn set(&self, id: &str, value: &str) -> bool {
        if id.is_empty() || id.contains(char::is_whitespace) || value.trim().is_empty() {
            warn!(%id, %value, "invalid SET");
            return false;
        }
        self.send(&Line::Set(Event::new(id, value.trim())).to_string())
    }

    /// Drop any partial transfer and ask for the layout again.
    pub fn request_config(&self) -> bool {
        self.shared.clear_rx();
        self.send(GETCFG)
    }

    /// `request_config` after the configured settle delay, giving the
    /// device time to finish its own connection setup.
    pub async fn request_config_after_delay(&self) -> bool {
        tokio::time::sleep(self.getcfg_delay).await;
        self.request_config()
    }

    /// Latest reported value of a widget
    pub fn value(&self, id: &str) -> Option<String> {
        lock(&self.shared.values).get(id).cloned()
    }

    pub fn values(&self) -> HashMap<String, String> {
        lock(&self.shared.values).clone()
    }

    /// The most recently received layout
    pub fn config(&self) -> Option<Config> {
        lock(&self.shared.config).clone()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Wait up to `limit` for outbound lines to be written.
    pub async fn flush(&self, limit: Duration) -> bool {
        self.queue.flush(limit).await
    }

    /// Stop receiving and sending. Does not touch the transport itself.
    pub fn close(&self) {
        self.task.abort();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.clear_rx();
        self.queue.reset();
        self.queue.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run<I>(
    mut inbound: I,
    mut notices: mpsc::UnboundedReceiver<QueueNotice>,
    queue: SendQueue,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    I: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            fragment = inbound.next() => match fragment {
                Some(bytes) => shared.receive(&bytes, &events),
                None => {
                    shared.disconnected(&queue, &events, None);
                    break;
                }
            },
            Some(notice) = notices.recv() => match notice {
                QueueNotice::Disconnected(error) => {
                    shared.disconnected(&queue, &events, Some(error));
                    break;
                }
                QueueNotice::RetriesExhausted { line, error } => {
                    let _ = events.send(SessionEvent::SendFailed { line, error });
                }
            },
        }
    }
}

//! Notification fan-out: templated rendering, per-sink batching with a
//! bounded queue, and the watcher-refcount drain protocol.
//!
//! One `Notifier` wraps one delivery sink and may be shared by many
//! watchers. Every watcher registers with `add_watcher` before its pass and
//! sends `Event::Done` when it finishes; when the last registered watcher is
//! done the remaining queued bodies are flushed, so every event accepted
//! into the queue is delivered exactly once.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use minijinja::{Environment, context};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::config::NotifierConfig;
use crate::sink::{DeliveryError, Sink};

const BATCH_TEMPLATE: &str = "Noidd detected changes to the filesystem on host: \
{{ hostname }}:\n{% for message in messages %} - {{ message }}\n{% endfor %}";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("watcher refcount dropped below zero")]
    RefcountUnderflow,

    #[error("batch template failed to render: {0}")]
    Template(#[from] minijinja::Error),

    #[error("could not build delivery client: {0}")]
    Client(#[from] DeliveryError),
}

/// A change observed by a watcher, or the end-of-pass marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created { path: String, mtime: String },
    Modified { path: String, mtime: String },
    Deleted { path: String },
    Done,
}

impl Event {
    /// One-line body for this event; `None` for the `Done` marker.
    pub fn render(&self) -> Option<String> {
        match self {
            Event::Created { path, mtime } => {
                Some(format!("the file: {path} was created on: {mtime}"))
            }
            Event::Modified { path, mtime } => {
                Some(format!("the file: {path} was modified: {mtime}"))
            }
            Event::Deleted { path } => Some(format!("the file: {path} was deleted")),
            Event::Done => None,
        }
    }
}

pub struct Notifier {
    sink: Sink,
    batch: bool,
    message_limit: usize,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<mpsc::Receiver<String>>,
    watch_count: AtomicI64,
    received: AtomicU64,
    sent: AtomicU64,
    delivery_failures: AtomicU64,
    templates: Environment<'static>,
    host: String,
}

impl Notifier {
    pub fn new(sink: Sink, batch: bool, message_limit: usize) -> Self {
        let message_limit = message_limit.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(message_limit);
        Notifier {
            sink,
            batch,
            message_limit,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            watch_count: AtomicI64::new(0),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            templates: Environment::new(),
            host: host_name(),
        }
    }

    pub fn from_config(config: &NotifierConfig) -> Result<Self, NotifyError> {
        use crate::sink::{PushoverSink, TwilioSink};

        let notifier = match config {
            NotifierConfig::Stdout { batch, message_limit } => {
                Notifier::new(Sink::Stdout, *batch, *message_limit)
            }
            NotifierConfig::Twilio {
                twilio_account_sid,
                twilio_auth_token,
                twilio_from_number,
                recipients,
                batch,
                message_limit,
                live,
            } => {
                let sink = TwilioSink::new(
                    twilio_account_sid.clone(),
                    twilio_auth_token.clone(),
                    twilio_from_number.clone(),
                    recipients.clone(),
                    *live,
                )?;
                Notifier::new(Sink::Twilio(sink), *batch, *message_limit)
            }
            NotifierConfig::Pushover {
                pushover_user_key,
                pushover_api_token,
                batch,
                message_limit,
                live,
            } => {
                let sink = PushoverSink::new(
                    pushover_user_key.clone(),
                    pushover_api_token.clone(),
                    *live,
                )?;
                Notifier::new(Sink::Pushover(sink), *batch, *message_limit)
            }
        };
        Ok(notifier)
    }

    /// Register one watcher. Each watcher must call this during its start
    /// phase, before any of its events can race with `Done`.
    pub fn add_watcher(&self) {
        self.watch_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sink_kind(&self) -> &'static str {
        self.sink.kind()
    }

    pub fn watch_count(&self) -> i64 {
        self.watch_count.load(Ordering::SeqCst)
    }

    pub fn notifications_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::SeqCst)
    }

    /// Accept one event.
    ///
    /// `Done` decrements the watcher refcount and flushes once it reaches
    /// zero. Anything else is rendered and either delivered immediately
    /// (unbatched) or queued; a full queue is flushed before the event is
    /// enqueued, so no event is ever dropped.
    pub async fn notify(&self, event: Event) -> Result<(), NotifyError> {
        let Some(body) = event.render() else {
            let previous = self.watch_count.fetch_sub(1, Ordering::SeqCst);
            if previous <= 0 {
                self.watch_count.fetch_add(1, Ordering::SeqCst);
                return Err(NotifyError::RefcountUnderflow);
            }
            if previous == 1 {
                self.flush().await?;
            }
            return Ok(());
        };

        self.received.fetch_add(1, Ordering::SeqCst);

        if !self.batch {
            self.deliver(&body, 1).await;
            return Ok(());
        }

        match self.queue_tx.try_send(body) {
            Ok(()) => {}
            Err(TrySendError::Full(body)) => {
                self.flush().await?;
                if self.queue_tx.send(body).await.is_err() {
                    warn!(sink = self.sink.kind(), "notification queue closed");
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(sink = self.sink.kind(), "notification queue closed");
            }
        }
        Ok(())
    }

    /// Drain up to `message_limit` queued bodies into one batched delivery.
    pub async fn flush(&self) -> Result<(), NotifyError> {
        let messages = {
            let mut queue = self.queue_rx.lock().await;
            let mut messages = Vec::new();
            while messages.len() < self.message_limit {
                match queue.try_recv() {
                    Ok(message) => messages.push(message),
                    Err(_) => break,
                }
            }
            messages
        };

        if messages.is_empty() {
            return Ok(());
        }

        let body = self.templates.render_str(
            BATCH_TEMPLATE,
            context! { hostname => self.host.clone(), messages => &messages },
        )?;
        self.deliver(&body, messages.len() as u64).await;
        Ok(())
    }

    /// Hand one body to the sink, accounting for `count` events. Delivery
    /// failures are recoverable: logged and counted, never raised.
    async fn deliver(&self, body: &str, count: u64) {
        match self.sink.deliver(body).await {
            Ok(()) => debug!(sink = self.sink.kind(), events = count, "delivered"),
            Err(e) => {
                self.delivery_failures.fetch_add(1, Ordering::SeqCst);
                warn!(sink = self.sink.kind(), error = %e, "delivery failed");
            }
        }
        self.sent.fetch_add(count, Ordering::SeqCst);
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

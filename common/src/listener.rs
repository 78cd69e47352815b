use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, SyncSender, TryRecvError, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    error::NodeError,
    interval::ReportingInterval,
    link::MqttLink,
    store::{IntervalStore, RecordStorage},
    types::InboundMessage,
};

pub const MIN_CONFIG_PAYLOAD_BYTES: usize = 2;
pub const MAX_CONFIG_PAYLOAD_BYTES: usize = 128;

const STOP_CHECK_PERIOD: Duration = Duration::from_millis(10);

pub struct ConfigListener<R> {
    inbox: Receiver<InboundMessage>,
    store: IntervalStore<R>,
}

impl<R: RecordStorage> ConfigListener<R> {
    pub fn new(inbox: Receiver<InboundMessage>, store: IntervalStore<R>) -> Self {
        Self { inbox, store }
    }

    pub fn drain(&self, interval: &mut ReportingInterval) -> usize {
        let mut applied = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(message) => {
                    if self.apply(&message, interval).is_some() {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    pub fn apply(
        &self,
        message: &InboundMessage,
        interval: &mut ReportingInterval,
    ) -> Option<ReportingInterval> {
        let text = String::from_utf8_lossy(&message.payload);
        info!("config message on {}: `{}`", message.topic, text.trim());

        if message.payload.len() <= MIN_CONFIG_PAYLOAD_BYTES {
            debug!("ignoring {}-byte config payload", message.payload.len());
            return None;
        }

        let updated = ReportingInterval::decode(&text);
        *interval = updated;
        info!("interval updated to {}", updated.encode());

        if let Err(err) = self.store.save(updated) {
            warn!("failed to persist interval {}: {err}", updated.encode());
        }
        Some(updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStop {
    Stopped,
    TimedOut,
    NotRunning,
}

pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// A thread that overruns `grace` is left detached.
    pub fn stop(&mut self, grace: Duration) -> PollerStop {
        let Some(thread) = self.thread.take() else {
            return PollerStop::NotRunning;
        };

        self.stop.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + grace;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return PollerStop::TimedOut;
            }
            thread::sleep(STOP_CHECK_PERIOD);
        }

        if thread.join().is_err() {
            warn!("mqtt poll thread panicked");
        }
        PollerStop::Stopped
    }
}

pub struct PollerSettings {
    pub config_topic: String,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
    pub stack_size: usize,
}

pub fn spawn_poller<L: MqttLink + 'static>(
    link: Arc<L>,
    outbox: SyncSender<InboundMessage>,
    settings: PollerSettings,
) -> Result<PollerHandle, NodeError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(settings.stack_size)
        .spawn(move || poll_loop(link.as_ref(), &outbox, &settings, &thread_stop))
        .map_err(|source| NodeError::Spawn {
            name: "mqtt-poll",
            source,
        })?;

    Ok(PollerHandle {
        stop,
        thread: Some(thread),
    })
}

fn poll_loop<L: MqttLink>(
    link: &L,
    outbox: &SyncSender<InboundMessage>,
    settings: &PollerSettings,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        let message = match link.poll(settings.poll_timeout) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!("mqtt poll error: {err}");
                sleep_unless_stopped(settings.error_backoff, stop);
                continue;
            }
        };

        if message.topic != settings.config_topic {
            debug!("ignoring message on unexpected topic {}", message.topic);
            continue;
        }

        if message.payload.len() > MAX_CONFIG_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                message.topic,
                message.payload.len()
            );
            continue;
        }

        match outbox.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("config queue full; dropping message on {}", message.topic);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("config listener gone; poller exiting");
                return;
            }
        }
    }
    debug!("mqtt poll thread stopped");
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(STOP_CHECK_PERIOD.min(deadline - now));
    }
}

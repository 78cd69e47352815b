//! In-memory doubles for the platform traits.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use embedded_hal::delay::DelayNs;

use crate::{
    error::{LinkError, PowerError, SensorError, StorageError},
    link::{ClimateSensor, MqttLink},
    sleep::{HibernateHooks, PowerControl},
    store::RecordStorage,
    types::{InboundMessage, Qos, SensorSample, SleepMode},
};

#[derive(Default)]
struct LinkState {
    connect_results: VecDeque<Result<(), LinkError>>,
    publish_results: VecDeque<bool>,
    published: Vec<(String, String)>,
    subscriptions: Vec<(String, Qos)>,
    inbound: VecDeque<InboundMessage>,
    poll_errors: usize,
    poll_block: Option<Duration>,
}

/// Connects and publishes successfully unless results are queued.
#[derive(Default)]
pub struct MockLink {
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    state: Mutex<LinkState>,
}

impl MockLink {
    pub fn connected() -> Self {
        let link = Self::default();
        link.connected.store(true, Ordering::SeqCst);
        link
    }

    pub fn queue_connect_results(&self, results: impl IntoIterator<Item = Result<(), LinkError>>) {
        self.state.lock().unwrap().connect_results.extend(results);
    }

    pub fn queue_publish_results(&self, results: impl IntoIterator<Item = bool>) {
        self.state.lock().unwrap().publish_results.extend(results);
    }

    pub fn queue_inbound(&self, messages: impl IntoIterator<Item = InboundMessage>) {
        self.state.lock().unwrap().inbound.extend(messages);
    }

    pub fn queue_poll_errors(&self, count: usize) {
        self.state.lock().unwrap().poll_errors += count;
    }

    /// Every poll blocks for `duration` regardless of its timeout.
    pub fn set_poll_block(&self, duration: Duration) {
        self.state.lock().unwrap().poll_block = Some(duration);
    }

    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Successful publishes only, payloads as text.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Qos)> {
        self.state.lock().unwrap().subscriptions.clone()
    }
}

impl MqttLink for MockLink {
    fn connect(&self) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .state
            .lock()
            .unwrap()
            .connect_results
            .pop_front()
            .unwrap_or(Ok(()));
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: Qos) -> Result<(), LinkError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.publish_results.pop_front().unwrap_or(true) {
            return Err(LinkError::Transport("queued failure".to_string()));
        }
        state.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, LinkError> {
        let (block, next) = {
            let mut state = self.state.lock().unwrap();
            if let Some(block) = state.poll_block {
                (Some(block), None)
            } else if state.poll_errors > 0 {
                state.poll_errors -= 1;
                return Err(LinkError::Transport("queued poll error".to_string()));
            } else {
                (None, state.inbound.pop_front())
            }
        };

        if let Some(block) = block {
            thread::sleep(block);
            return Ok(None);
        }
        if next.is_none() {
            thread::sleep(timeout);
        }
        Ok(next)
    }
}

#[derive(Default)]
struct StorageState {
    records: HashMap<String, Vec<u8>>,
    fail_io: bool,
}

/// Clones share the same records, so a test can keep a handle after moving
/// one into a store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn record(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().records.get(name).cloned()
    }

    pub fn put(&self, name: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(name.to_string(), data.to_vec());
    }

    pub fn fail_io(&self, fail: bool) {
        self.state.lock().unwrap().fail_io = fail;
    }
}

impl RecordStorage for MemoryStorage {
    fn read_record(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(StorageError::Backend("injected read failure".to_string()));
        }
        let Some(data) = state.records.get(name) else {
            return Ok(0);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn write_record(&mut self, name: &str, data: &[u8]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        state.records.insert(name.to_string(), data.to_vec());
        Ok(data.len())
    }
}

/// Replays a fixed sequence of reads, then repeats the fallback forever.
pub struct MockSensor {
    queued: VecDeque<Result<SensorSample, SensorError>>,
    fallback: Result<SensorSample, SensorError>,
    reads: usize,
}

impl MockSensor {
    pub fn repeating(result: Result<SensorSample, SensorError>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: result,
            reads: 0,
        }
    }

    pub fn sequence(results: Vec<Result<SensorSample, SensorError>>) -> Self {
        Self {
            queued: results.into(),
            fallback: Err(SensorError::Timeout),
            reads: 0,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl ClimateSensor for MockSensor {
    fn read(&mut self) -> Result<SensorSample, SensorError> {
        self.reads += 1;
        self.queued
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Records millisecond delays instead of sleeping.
#[derive(Clone, Default)]
pub struct RecordingDelay {
    delays: Arc<Mutex<Vec<u32>>>,
}

impl RecordingDelay {
    pub fn delays(&self) -> Vec<u32> {
        self.delays.lock().unwrap().clone()
    }
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, _ns: u32) {}

    fn delay_ms(&mut self, ms: u32) {
        self.delays.lock().unwrap().push(ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    RadioOff,
    SleepSync,
    Hooks,
    Vote(SleepMode),
    ArmTimer(Duration),
}

#[derive(Default)]
struct PowerState {
    calls: Vec<PowerCall>,
    fail: bool,
}

#[derive(Clone, Default)]
pub struct MockPower {
    state: Arc<Mutex<PowerState>>,
}

impl MockPower {
    pub fn calls(&self) -> Vec<PowerCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    fn record(&self, call: PowerCall) -> Result<(), PowerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.fail {
            Err(PowerError::Platform(format!("injected failure in {call:?}")))
        } else {
            Ok(())
        }
    }
}

impl PowerControl for MockPower {
    fn radio_minimum_function(&mut self) -> Result<(), PowerError> {
        self.record(PowerCall::RadioOff)
    }

    fn sleep_sync(&mut self) -> Result<(), PowerError> {
        self.record(PowerCall::SleepSync)
    }

    fn register_hibernate_hooks(&mut self, _hooks: HibernateHooks) {
        self.state.lock().unwrap().calls.push(PowerCall::Hooks);
    }

    fn enable_sleep_vote(&mut self, mode: SleepMode) -> Result<(), PowerError> {
        self.record(PowerCall::Vote(mode))
    }

    fn arm_wake_timer(&mut self, delay: Duration) -> Result<(), PowerError> {
        self.record(PowerCall::ArmTimer(delay))
    }

    fn idle(&mut self, period: Duration) {
        thread::sleep(period);
    }
}

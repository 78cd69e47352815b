use std::{
    env, fs, io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use embedded_hal::delay::DelayNs;
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, Incoming, MqttOptions, QoS,
    RecvTimeoutError,
};
use tracing::{debug, error, info, warn};

use senseclima_common::{
    node, BrokerConfig, ClimateSensor, HibernateHooks, InboundMessage, LinkError, MqttLink,
    NodeConfig, Platform, PowerControl, PowerError, Qos, RecordStorage, SensorError, SensorSample,
    SleepMode, StorageError,
};

const DEFAULT_STATE_DIR: &str = ".senseclima";
const REQUEST_CAPACITY: usize = 16;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::from_build_env();
    let state_dir = option_env!("SENSECLIMA_STATE_DIR").unwrap_or(DEFAULT_STATE_DIR);
    info!(
        "senseclima node {} starting (state in {state_dir})",
        config.broker.client_id
    );

    let link = Arc::new(RumqttLink::new(&config.broker));
    let platform = Platform {
        link: Arc::clone(&link),
        storage: FileStorage::new(state_dir),
        delay: StdDelay,
        power: HostPower::new(link),
    };

    let _duty_cycle = node::start(config, platform, SimulatedSensor::default)
        .context("failed to start duty cycle")?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn to_rumqttc_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

pub struct RumqttLink {
    options: MqttOptions,
    connect_timeout: Duration,
    client: Mutex<Option<Client>>,
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<(String, Qos)>>,
}

impl RumqttLink {
    pub fn new(broker: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.into()));
        options.set_clean_session(true);
        if !broker.username.is_empty() {
            options.set_credentials(&broker.username, &broker.password);
        }

        Self {
            options,
            connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
            client: Mutex::new(None),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Drops the session; the next `connect` starts a fresh one.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if let Err(err) = client.try_disconnect() {
                debug!("mqtt disconnect request failed: {err}");
            }
        }
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn wait_for_connack(&self, connection: &mut Connection) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout);
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(LinkError::Refused(format!("{code:?}"))),
                    };
                }
                Ok(Ok(event)) => debug!("mqtt event before connack: {event:?}"),
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    return Err(LinkError::Refused(format!("{code:?}")))
                }
                Ok(Err(err)) => return Err(LinkError::Transport(err.to_string())),
                Err(RecvTimeoutError::Timeout) => return Err(LinkError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LinkError::Transport("event loop closed".to_string()))
                }
            }
        }
    }

    fn replay_subscriptions(&self, client: &Client) {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (topic, qos) in subscriptions {
            match client.try_subscribe(topic.as_str(), to_rumqttc_qos(qos)) {
                Ok(()) => info!("subscribed to {topic}"),
                Err(err) => warn!("subscribe to {topic} failed: {err}"),
            }
        }
    }
}

impl MqttLink for RumqttLink {
    fn connect(&self) -> Result<(), LinkError> {
        self.disconnect();

        let (client, mut connection) = Client::new(self.options.clone(), REQUEST_CAPACITY);
        self.wait_for_connack(&mut connection)?;

        self.replay_subscriptions(&client);
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = client.as_ref().ok_or(LinkError::NotConnected)?;
        client
            .try_publish(topic, to_rumqttc_qos(qos), false, payload.to_vec())
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subscriptions.iter().any(|(known, _)| known == topic) {
                subscriptions.push((topic.to_string(), qos));
            }
        }

        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = client.as_ref().ok_or(LinkError::NotConnected)?;
        client
            .try_subscribe(topic, to_rumqttc_qos(qos))
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        info!("subscribed to {topic}");
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, LinkError> {
        let mut guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = guard.as_mut() else {
            drop(guard);
            thread::sleep(timeout);
            return Ok(None);
        };

        let error = match connection.recv_timeout(timeout) {
            Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                return Ok(Some(InboundMessage::new(
                    publish.topic,
                    publish.payload.to_vec(),
                )));
            }
            Ok(Ok(Event::Incoming(Incoming::Disconnect))) => {
                LinkError::Transport("broker closed the session".to_string())
            }
            Ok(Ok(_)) | Err(RecvTimeoutError::Timeout) => return Ok(None),
            Ok(Err(err)) => LinkError::Transport(err.to_string()),
            Err(RecvTimeoutError::Disconnected) => {
                LinkError::Transport("event loop closed".to_string())
            }
        };

        guard.take();
        drop(guard);
        self.connected.store(false, Ordering::SeqCst);
        Err(error)
    }
}

pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RecordStorage for FileStorage {
    fn read_record(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let data = match fs::read(self.dir.join(name)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn write_record(&mut self, name: &str, data: &[u8]) -> Result<usize, StorageError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(name), data)?;
        Ok(data.len())
    }
}

#[derive(Default)]
pub struct SimulatedSensor {
    tick: u64,
}

impl ClimateSensor for SimulatedSensor {
    fn read(&mut self) -> Result<SensorSample, SensorError> {
        self.tick = self.tick.saturating_add(1);
        let temperature_c = 21.0 + (self.tick % 8) as f32 * 0.2;
        let humidity = 48.0 + (self.tick % 6) as f32 * 0.5;
        Ok(SensorSample::from_f32(temperature_c, humidity))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns.into()));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}

pub struct HostPower {
    link: Arc<RumqttLink>,
    hooks: HibernateHooks,
    mode: SleepMode,
    wake_after: Option<Duration>,
}

impl HostPower {
    pub fn new(link: Arc<RumqttLink>) -> Self {
        Self {
            link,
            hooks: HibernateHooks::default(),
            mode: SleepMode::default(),
            wake_after: None,
        }
    }

    fn restart(&self) -> io::Error {
        let exe = match env::current_exe() {
            Ok(exe) => exe,
            Err(err) => return err,
        };
        Command::new(exe).args(env::args_os().skip(1)).exec()
    }
}

impl PowerControl for HostPower {
    fn radio_minimum_function(&mut self) -> Result<(), PowerError> {
        self.link.disconnect();
        Ok(())
    }

    fn register_hibernate_hooks(&mut self, hooks: HibernateHooks) {
        self.hooks = hooks;
    }

    fn enable_sleep_vote(&mut self, mode: SleepMode) -> Result<(), PowerError> {
        self.mode = mode;
        Ok(())
    }

    fn arm_wake_timer(&mut self, delay: Duration) -> Result<(), PowerError> {
        self.wake_after = Some(delay);
        Ok(())
    }

    fn idle(&mut self, period: Duration) {
        let Some(wake_after) = self.wake_after.take() else {
            thread::sleep(period);
            return;
        };

        (self.hooks.before)(self.mode);
        thread::sleep(wake_after);
        (self.hooks.after)(self.mode);

        info!("wake timer fired; restarting");
        let err = self.restart();
        error!("failed to restart after wake: {err}");
    }
}

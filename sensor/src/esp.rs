use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht22, DhtError};
use embedded_svc::{
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use senseclima_common::{
    node, BrokerConfig, ClimateSensor, HibernateHooks, InboundMessage, LinkError, MqttLink,
    NodeConfig, Platform, PowerControl, PowerError, Qos, RecordStorage, SensorError, SensorSample,
    SleepMode, StorageError,
};

const NVS_NAMESPACE: &str = "senseclima";

const DHT22_PIN: i32 = 16;

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const MQTT_EVENT_QUEUE_DEPTH: usize = 8;
const CONNECT_CHECK_PERIOD: Duration = Duration::from_millis(50);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    log_wake_cause();

    let config = NodeConfig::from_build_env();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition.clone()).context("wifi startup failed")?;

    let link = Arc::new(EspLink::new(&config.broker));
    let platform = Platform {
        link,
        storage: NvsStorage::new(nvs_partition),
        delay: FreeRtos,
        power: EspPower::default(),
    };

    let dht_pin = pins.gpio16.downgrade();
    let _duty_cycle = node::start(config, platform, move || Dht22Sensor::new(dht_pin))
        .context("failed to start duty cycle")?;

    // Keep the station up for the program lifetime; the duty cycle powers
    // the radio down itself before sleeping.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn log_wake_cause() {
    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    if cause == esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER {
        (HibernateHooks::default().after)(SleepMode::Hibernate);
    } else {
        info!("cold boot (wake cause {cause})");
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.is_empty() {
        return Err(anyhow!("WIFI_SSID was not set at build time"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return Err(anyhow::Error::from(err)
            .context(format!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed")));
    }

    Ok(esp_wifi)
}

fn to_esp_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn esp_check(rc: esp_idf_svc::sys::esp_err_t, call: &str) -> Result<(), PowerError> {
    if rc == esp_idf_svc::sys::ESP_OK {
        Ok(())
    } else {
        Err(PowerError::Platform(format!("{call} failed: esp_err_t={rc}")))
    }
}

struct EspLink {
    url: String,
    broker: BrokerConfig,
    client: Mutex<Option<EspMqttClient<'static>>>,
    connected: Arc<AtomicBool>,
    resubscribe: Arc<AtomicBool>,
    events_tx: SyncSender<InboundMessage>,
    events_rx: Mutex<Receiver<InboundMessage>>,
    subscriptions: Mutex<Vec<(String, Qos)>>,
}

impl EspLink {
    fn new(broker: &BrokerConfig) -> Self {
        let (events_tx, events_rx) = sync_channel(MQTT_EVENT_QUEUE_DEPTH);
        Self {
            url: format!("mqtt://{}:{}", broker.host, broker.port),
            broker: broker.clone(),
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            resubscribe: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Mutex::new(events_rx),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn create_client(&self) -> Result<EspMqttClient<'static>, EspError> {
        let conf = MqttClientConfiguration {
            client_id: Some(self.broker.client_id.as_str()),
            username: (!self.broker.username.is_empty()).then_some(self.broker.username.as_str()),
            password: (!self.broker.password.is_empty()).then_some(self.broker.password.as_str()),
            keep_alive_interval: Some(Duration::from_secs(self.broker.keep_alive_secs.into())),
            ..Default::default()
        };

        let connected = Arc::clone(&self.connected);
        let resubscribe = Arc::clone(&self.resubscribe);
        let events = self.events_tx.clone();

        EspMqttClient::new_cb(&self.url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => {
                resubscribe.store(true, Ordering::SeqCst);
                connected.store(true, Ordering::SeqCst);
            }
            EventPayload::Disconnected => connected.store(false, Ordering::SeqCst),
            EventPayload::Received {
                topic: Some(topic),
                data,
                ..
            } => match events.try_send(InboundMessage::new(topic, data)) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(message)) => {
                    warn!("mqtt event queue full; dropping message on {}", message.topic);
                }
            },
            EventPayload::Error(err) => warn!("mqtt client error: {err:?}"),
            _ => {}
        })
    }

    fn replay_subscriptions(&self, client: &mut EspMqttClient<'static>) -> Result<(), LinkError> {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (topic, qos) in subscriptions {
            client
                .subscribe(&topic, to_esp_qos(qos))
                .map_err(|err| LinkError::Transport(format!("subscribe to {topic}: {err}")))?;
            info!("subscribed to {topic}");
        }
        self.resubscribe.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl MqttLink for EspLink {
    fn connect(&self) -> Result<(), LinkError> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if client.is_none() {
            *client = Some(
                self.create_client()
                    .map_err(|err| LinkError::Transport(err.to_string()))?,
            );
        }

        let deadline = Instant::now() + Duration::from_millis(self.broker.connect_timeout_ms);
        while !self.connected.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }
            thread::sleep(CONNECT_CHECK_PERIOD);
        }

        match client.as_mut() {
            Some(client) => self.replay_subscriptions(client),
            None => Err(LinkError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.resubscribe.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = client.as_mut().ok_or(LinkError::NotConnected)?;
        client
            .publish(topic, to_esp_qos(qos), false, payload)
            .map(|id| debug!("publish {id} queued on {topic}"))
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

        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = client.as_mut().ok_or(LinkError::NotConnected)?;
        client
            .subscribe(topic, to_esp_qos(qos))
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        info!("subscribed to {topic}");
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, LinkError> {
        let events = self.events_rx.lock().unwrap_or_else(PoisonError::into_inner);
        match events.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(LinkError::Transport("mqtt event channel closed".to_string()))
            }
        }
    }
}

struct NvsStorage {
    partition: EspDefaultNvsPartition,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }

    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StorageError::Backend(format!("nvs open: {err}")))
    }
}

impl RecordStorage for NvsStorage {
    fn read_record(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let nvs = self.open()?;
        let read = nvs
            .get_raw(name, buf)
            .map_err(|err| StorageError::Backend(format!("nvs read {name}: {err}")))?;
        Ok(read.map_or(0, <[u8]>::len))
    }

    fn write_record(&mut self, name: &str, data: &[u8]) -> Result<usize, StorageError> {
        let mut nvs = self.open()?;
        nvs.set_raw(name, data)
            .map_err(|err| StorageError::Backend(format!("nvs write {name}: {err}")))?;
        Ok(data.len())
    }
}

/// A pin that failed to initialise reads as a bus error every tick, so the
/// duty cycle still reports `error` and sleeps.
struct Dht22Sensor {
    pin: Option<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> Self {
        let pin = Self::init_pin(pin)
            .inspect_err(|err| warn!("failed to initialise DHT22 on GPIO{DHT22_PIN}: {err:#}"))
            .ok();
        Self { pin, delay: Ets }
    }

    fn init_pin(pin: AnyIOPin) -> anyhow::Result<PinDriver<'static, AnyIOPin, InputOutput>> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(pin)
    }
}

impl ClimateSensor for Dht22Sensor {
    fn read(&mut self) -> Result<SensorSample, SensorError> {
        let Some(pin) = self.pin.as_mut() else {
            return Err(SensorError::Bus(format!("no sensor on GPIO{DHT22_PIN}")));
        };
        pin.set_high()
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;

        match dht22::blocking::read(&mut self.delay, pin) {
            Ok(reading) => Ok(SensorSample::from_f32(
                reading.temperature,
                reading.relative_humidity,
            )),
            Err(DhtError::Timeout) => Err(SensorError::Timeout),
            Err(DhtError::ChecksumMismatch) => Err(SensorError::Checksum),
            Err(err) => Err(SensorError::Bus(format!("{err:?}"))),
        }
    }
}

#[derive(Default)]
struct EspPower {
    hooks: HibernateHooks,
    mode: SleepMode,
    timer_armed: bool,
}

impl PowerControl for EspPower {
    fn radio_minimum_function(&mut self) -> Result<(), PowerError> {
        esp_check(unsafe { esp_idf_svc::sys::esp_wifi_stop() }, "esp_wifi_stop")
    }

    fn register_hibernate_hooks(&mut self, hooks: HibernateHooks) {
        self.hooks = hooks;
    }

    fn enable_sleep_vote(&mut self, mode: SleepMode) -> Result<(), PowerError> {
        self.mode = mode;
        Ok(())
    }

    fn arm_wake_timer(&mut self, delay: Duration) -> Result<(), PowerError> {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        esp_check(
            unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) },
            "esp_sleep_enable_timer_wakeup",
        )?;
        self.timer_armed = true;
        Ok(())
    }

    /// Deep sleep for `Hibernate`; light sleep followed by a restart for the
    /// shallower modes, so every wake re-enters the normal boot path.
    fn idle(&mut self, period: Duration) {
        if !self.timer_armed {
            thread::sleep(period);
            return;
        }

        (self.hooks.before)(self.mode);
        match self.mode {
            SleepMode::Hibernate => unsafe { esp_idf_svc::sys::esp_deep_sleep_start() },
            SleepMode::Sleep1 | SleepMode::Sleep2 => {
                let rc = unsafe { esp_idf_svc::sys::esp_light_sleep_start() };
                if let Err(err) = esp_check(rc, "esp_light_sleep_start") {
                    warn!("{err}");
                    self.timer_armed = false;
                    return;
                }
                (self.hooks.after)(self.mode);
                unsafe { esp_idf_svc::sys::esp_restart() }
            }
        }
    }
}

use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::{
    config::DutyCycleConfig,
    interval::ReportingInterval,
    link::{ClimateSensor, MqttLink},
    listener::{ConfigListener, PollerHandle},
    publisher::TelemetryPublisher,
    sleep::{PowerControl, SleepScheduler},
    store::{IntervalStore, RecordStorage},
    supervisor::ConnectionSupervisor,
    topics::{STATUS_ONLINE, TOPIC_HUMIDITY, TOPIC_INTERVAL, TOPIC_TEMPERATURE},
    types::{ConnectionState, Qos, SensorSample, SleepMode, Telemetry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    WaitForSensor,
    ReportLoop,
    Sleep,
}

impl CycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitForSensor => "WAIT_FOR_SENSOR",
            Self::ReportLoop => "REPORT_LOOP",
            Self::Sleep => "SLEEP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DutyCycleContext {
    pub interval: ReportingInterval,
    pub ready_samples: u32,
    pub failed_samples: u32,
    pub latest: Option<SensorSample>,
    pub state: CycleState,
}

impl DutyCycleContext {
    pub fn new(interval: ReportingInterval) -> Self {
        Self {
            interval,
            ready_samples: 0,
            failed_samples: 0,
            latest: None,
            state: CycleState::WaitForSensor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRequest {
    pub mode: SleepMode,
    pub interval: ReportingInterval,
    pub telemetry: Telemetry,
    pub report_passes: u32,
}

pub struct DutyCycleController<L, R, D> {
    config: DutyCycleConfig,
    supervisor: ConnectionSupervisor<L, D>,
    publisher: TelemetryPublisher<L>,
    listener: ConfigListener<R>,
    store: IntervalStore<R>,
    delay: D,
    ctx: DutyCycleContext,
}

impl<L, R, D> DutyCycleController<L, R, D>
where
    L: MqttLink,
    R: RecordStorage,
    D: DelayNs + Clone,
{
    pub fn new(
        config: DutyCycleConfig,
        qos: Qos,
        link: Arc<L>,
        listener: ConfigListener<R>,
        store: IntervalStore<R>,
        delay: D,
    ) -> Self {
        let supervisor =
            ConnectionSupervisor::new(Arc::clone(&link), delay.clone(), config.connect_backoff_ms);
        let interval =
            ReportingInterval::from_millis(config.default_interval_ms).unwrap_or_default();

        Self {
            config,
            supervisor,
            publisher: TelemetryPublisher::new(link, qos),
            listener,
            store,
            delay,
            ctx: DutyCycleContext::new(interval),
        }
    }

    pub fn context(&self) -> &DutyCycleContext {
        &self.ctx
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn connect(&mut self) {
        while self.supervisor.ensure_connected() == ConnectionState::Disconnected {
            self.drain_config();
        }
    }

    pub fn drain_config(&mut self) {
        let applied = self.listener.drain(&mut self.ctx.interval);
        if applied > 0 {
            debug!("{applied} interval update(s) applied");
        }
    }

    pub fn reload_interval(&mut self) -> ReportingInterval {
        match self.store.load() {
            Ok(Some(interval)) => self.ctx.interval = interval,
            Ok(None) => debug!("no persisted interval; keeping {}", self.ctx.interval),
            Err(err) => warn!(
                "failed to read persisted interval ({err}); keeping {}",
                self.ctx.interval
            ),
        }
        self.ctx.interval
    }

    pub fn report_interval_status(&mut self) -> u32 {
        let mut passes = 0_u32;
        loop {
            passes = passes.saturating_add(1);
            self.connect();
            self.drain_config();

            let interval = self.reload_interval();
            info!("active reporting interval {interval}");

            let published = self.publisher.publish(TOPIC_INTERVAL, STATUS_ONLINE);
            self.delay.delay_ms(self.config.publish_pacing_ms);
            if published {
                return passes;
            }
        }
    }

    pub fn wait_for_sensor<S: ClimateSensor>(&mut self, sensor: &mut S) -> Telemetry {
        self.ctx.state = CycleState::WaitForSensor;
        loop {
            self.drain_config();

            match sensor.read() {
                Ok(sample) => {
                    self.ctx.ready_samples = self.ctx.ready_samples.saturating_add(1);
                    self.ctx.latest = Some(sample);
                    debug!(
                        "sample {}/{}: {}°C {}%",
                        self.ctx.ready_samples,
                        self.config.ready_samples,
                        sample.temperature,
                        sample.humidity
                    );
                    if self.ctx.ready_samples >= self.config.ready_samples {
                        info!("temp {}°C | hum {}%", sample.temperature, sample.humidity);
                        return Telemetry::Reading(sample);
                    }
                }
                Err(err) => {
                    self.ctx.failed_samples = self.ctx.failed_samples.saturating_add(1);
                    warn!(
                        "sensor read failed ({} failures): {err}",
                        self.ctx.failed_samples
                    );
                    if self.ctx.failed_samples > self.config.failure_threshold {
                        warn!("sensor unhealthy; reporting `error`");
                        return Telemetry::SensorFault;
                    }
                }
            }

            self.delay.delay_ms(self.config.sample_period_ms);
        }
    }

    pub fn report(&mut self, telemetry: &Telemetry) -> u32 {
        self.ctx.state = CycleState::ReportLoop;
        let temperature = telemetry.temperature_payload();
        let humidity = telemetry.humidity_payload();

        let mut passes = 0_u32;
        loop {
            passes = passes.saturating_add(1);
            self.connect();
            self.drain_config();

            let temperature_ok = self.publisher.publish(TOPIC_TEMPERATURE, &temperature);
            self.delay.delay_ms(self.config.publish_pacing_ms);
            let humidity_ok = self.publisher.publish(TOPIC_HUMIDITY, &humidity);
            self.delay.delay_ms(self.config.publish_pacing_ms);

            if temperature_ok && humidity_ok {
                info!("values published after {passes} pass(es)");
                return passes;
            }

            warn!("report pass {passes} incomplete; retrying");
            self.delay.delay_ms(self.config.publish_retry_delay_ms);
        }
    }

    pub fn run_cycle<S: ClimateSensor>(&mut self, sensor: &mut S) -> SleepRequest {
        let telemetry = self.wait_for_sensor(sensor);
        let report_passes = self.report(&telemetry);

        self.drain_config();
        let interval = self.reload_interval();
        self.ctx.state = CycleState::Sleep;

        SleepRequest {
            mode: self.config.sleep_mode,
            interval,
            telemetry,
            report_passes,
        }
    }

    pub fn run<S, P>(
        mut self,
        mut sensor: S,
        scheduler: SleepScheduler<P>,
        poller: PollerHandle,
    ) -> !
    where
        S: ClimateSensor,
        P: PowerControl,
    {
        let request = self.run_cycle(&mut sensor);
        info!(
            "cycle complete ({}); sleeping for {}",
            self.ctx.state.as_str(),
            request.interval
        );
        scheduler.enter_sleep(request.mode, request.interval, poller)
    }
}

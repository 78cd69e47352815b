use std::{
    sync::{mpsc::sync_channel, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::{
    config::NodeConfig,
    controller::DutyCycleController,
    error::NodeError,
    link::{ClimateSensor, MqttLink},
    listener::{spawn_poller, ConfigListener, PollerSettings},
    sleep::{PowerControl, SleepScheduler},
    store::{IntervalStore, RecordStorage},
    topics::TOPIC_INTERVAL,
};

pub struct Platform<L, R, D, P> {
    pub link: Arc<L>,
    pub storage: R,
    pub delay: D,
    pub power: P,
}

/// The returned thread never finishes; the device resets when the wake
/// timer fires.
pub fn start<L, R, D, P, S, F>(
    config: NodeConfig,
    platform: Platform<L, R, D, P>,
    init_sensor: F,
) -> Result<JoinHandle<()>, NodeError>
where
    L: MqttLink + 'static,
    R: RecordStorage + Send + 'static,
    D: DelayNs + Clone + Send + 'static,
    P: PowerControl + Send + 'static,
    S: ClimateSensor + Send + 'static,
    F: FnOnce() -> S,
{
    let NodeConfig { broker, duty_cycle } = config;
    let Platform {
        link,
        storage,
        delay,
        power,
    } = platform;

    let store = IntervalStore::new(storage);
    let (outbox, inbox) = sync_channel(duty_cycle.inbound_queue_depth);
    let listener = ConfigListener::new(inbox, store.clone());

    let poller_settings = PollerSettings {
        config_topic: TOPIC_INTERVAL.to_string(),
        poll_timeout: Duration::from_millis(duty_cycle.poll_timeout_ms.into()),
        error_backoff: Duration::from_millis(duty_cycle.poll_error_backoff_ms.into()),
        stack_size: duty_cycle.poller_stack_size,
    };
    let duty_cycle_stack_size = duty_cycle.duty_cycle_stack_size;
    let scheduler = SleepScheduler::new(
        power,
        Duration::from_millis(duty_cycle.poller_grace_ms.into()),
        Duration::from_millis(duty_cycle.idle_log_period_ms.into()),
    );

    let mut controller = DutyCycleController::new(
        duty_cycle,
        broker.qos,
        Arc::clone(&link),
        listener,
        store,
        delay,
    );

    let interval = controller.reload_interval();
    info!("booting with reporting interval {interval}");

    info!("connecting to mqtt://{}:{}", broker.host, broker.port);
    controller.connect();

    if let Err(err) = link.subscribe(TOPIC_INTERVAL, broker.qos) {
        warn!("subscribe to {TOPIC_INTERVAL} failed: {err}; retried on reconnect");
    }

    let poller = spawn_poller(Arc::clone(&link), outbox, poller_settings)?;

    let passes = controller.report_interval_status();
    info!("status reported after {passes} pass(es)");

    info!("initialising sensor");
    let sensor = init_sensor();

    thread::Builder::new()
        .name("duty-cycle".to_string())
        .stack_size(duty_cycle_stack_size)
        .spawn(move || {
            controller.run(sensor, scheduler, poller);
        })
        .map_err(|source| NodeError::Spawn {
            name: "duty-cycle",
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        store::INTERVAL_RECORD,
        testing::{MemoryStorage, MockLink, MockPower, MockSensor, PowerCall, RecordingDelay},
        topics::{STATUS_ONLINE, TOPIC_HUMIDITY, TOPIC_TEMPERATURE},
        types::{Qos, SensorSample, SleepMode},
    };
    use pretty_assertions::assert_eq;

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for the node");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn boot_reports_status_then_telemetry_then_sleeps() {
        let link = Arc::new(MockLink::default());
        let storage = MemoryStorage::default();
        storage.put(INTERVAL_RECORD, &120_000_u32.to_le_bytes());
        let power = MockPower::default();

        let _node = start(
            NodeConfig::default(),
            Platform {
                link: Arc::clone(&link),
                storage,
                delay: RecordingDelay::default(),
                power: power.clone(),
            },
            || MockSensor::repeating(Ok(SensorSample::from_f32(25.3, 60.2))),
        )
        .unwrap();

        wait_for(|| power.calls().iter().any(|call| matches!(call, PowerCall::ArmTimer(_))));

        assert_eq!(link.connect_calls(), 1);
        assert_eq!(
            link.subscriptions(),
            vec![(TOPIC_INTERVAL.to_string(), Qos::AtMostOnce)]
        );
        assert_eq!(
            link.published(),
            vec![
                (TOPIC_INTERVAL.to_string(), STATUS_ONLINE.to_string()),
                (TOPIC_TEMPERATURE.to_string(), "25.3".to_string()),
                (TOPIC_HUMIDITY.to_string(), "60.2".to_string()),
            ]
        );
        assert_eq!(
            power.calls(),
            vec![
                PowerCall::RadioOff,
                PowerCall::SleepSync,
                PowerCall::Hooks,
                PowerCall::Vote(SleepMode::Hibernate),
                PowerCall::ArmTimer(Duration::from_millis(120_000)),
            ]
        );
    }
}

use std::sync::Arc;

use log::{info, warn};

use crate::{link::MqttLink, types::Qos};

pub struct TelemetryPublisher<L> {
    link: Arc<L>,
    qos: Qos,
}

impl<L: MqttLink> TelemetryPublisher<L> {
    pub fn new(link: Arc<L>, qos: Qos) -> Self {
        Self { link, qos }
    }

    pub fn publish(&self, topic: &str, payload: &str) -> bool {
        match self.link.publish(topic, payload.as_bytes(), self.qos) {
            Ok(()) => {
                info!("published `{payload}` to {topic}");
                true
            }
            Err(err) => {
                warn!("failed to publish to {topic}: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLink;

    #[test]
    fn reports_transport_outcome_without_retrying() {
        let link = Arc::new(MockLink::connected());
        link.queue_publish_results([false]);
        let publisher = TelemetryPublisher::new(link.clone(), Qos::AtMostOnce);

        assert!(!publisher.publish("t", "1.0"));
        assert!(publisher.publish("t", "2.0"));
        assert_eq!(link.publish_calls(), 2);
        assert_eq!(link.published(), vec![("t".to_string(), "2.0".to_string())]);
    }
}

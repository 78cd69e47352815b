use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::{link::MqttLink, types::ConnectionState};

pub struct ConnectionSupervisor<L, D> {
    link: Arc<L>,
    delay: D,
    backoff_ms: u32,
    state: ConnectionState,
    attempts: u64,
}

impl<L: MqttLink, D: DelayNs> ConnectionSupervisor<L, D> {
    pub fn new(link: Arc<L>, delay: D, backoff_ms: u32) -> Self {
        Self {
            link,
            delay,
            backoff_ms,
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn ensure_connected(&mut self) -> ConnectionState {
        if self.link.is_connected() {
            self.transition(ConnectionState::Connected);
            return self.state;
        }

        if self.state == ConnectionState::Connected {
            warn!("broker session lost");
            self.transition(ConnectionState::Disconnected);
        }

        self.attempts = self.attempts.saturating_add(1);
        match self.link.connect() {
            Ok(()) => {
                info!("mqtt connected after {} attempt(s)", self.attempts);
                self.transition(ConnectionState::Connected);
            }
            Err(err) => {
                warn!(
                    "mqtt connect attempt {} failed: {err}; retrying in {} ms",
                    self.attempts, self.backoff_ms
                );
                self.delay.delay_ms(self.backoff_ms);
            }
        }

        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("connection {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

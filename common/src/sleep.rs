use core::time::Duration;

use log::{info, warn};

use crate::{
    error::PowerError,
    interval::ReportingInterval,
    listener::{PollerHandle, PollerStop},
    types::SleepMode,
};

pub type HibernateHook = fn(SleepMode);

#[derive(Debug, Clone, Copy)]
pub struct HibernateHooks {
    pub before: HibernateHook,
    pub after: HibernateHook,
}

impl Default for HibernateHooks {
    fn default() -> Self {
        Self {
            before: log_before_hibernate,
            after: log_after_hibernate,
        }
    }
}

fn log_before_hibernate(mode: SleepMode) {
    info!("entering {} low-power state", mode.as_str());
}

fn log_after_hibernate(mode: SleepMode) {
    info!("woke from {} low-power state", mode.as_str());
}

pub trait PowerControl {
    fn radio_minimum_function(&mut self) -> Result<(), PowerError>;

    fn sleep_sync(&mut self) -> Result<(), PowerError> {
        Ok(())
    }

    fn register_hibernate_hooks(&mut self, hooks: HibernateHooks);

    fn enable_sleep_vote(&mut self, mode: SleepMode) -> Result<(), PowerError>;

    fn arm_wake_timer(&mut self, delay: Duration) -> Result<(), PowerError>;

    fn idle(&mut self, period: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub mode: SleepMode,
    pub interval: ReportingInterval,
    pub poller: PollerStop,
    pub timer_armed: bool,
}

pub struct SleepScheduler<P> {
    power: P,
    hooks: HibernateHooks,
    poller_grace: Duration,
    idle_period: Duration,
}

impl<P: PowerControl> SleepScheduler<P> {
    pub fn new(power: P, poller_grace: Duration, idle_period: Duration) -> Self {
        Self {
            power,
            hooks: HibernateHooks::default(),
            poller_grace,
            idle_period,
        }
    }

    pub fn prepare(
        &mut self,
        mode: SleepMode,
        interval: ReportingInterval,
        poller: &mut PollerHandle,
    ) -> SleepPlan {
        let poller = poller.stop(self.poller_grace);
        match poller {
            PollerStop::Stopped => info!("mqtt poll thread stopped"),
            PollerStop::TimedOut => warn!(
                "mqtt poll thread still running after {} ms; sleeping anyway",
                self.poller_grace.as_millis()
            ),
            PollerStop::NotRunning => {}
        }

        info!("=== entering sleep mode {} ===", mode.as_str());

        if let Err(err) = self.power.radio_minimum_function() {
            warn!("radio shutdown failed: {err}");
        }
        if let Err(err) = self.power.sleep_sync() {
            warn!("sleep sync failed: {err}");
        }

        self.power.register_hibernate_hooks(self.hooks);

        if let Err(err) = self.power.enable_sleep_vote(mode) {
            warn!("sleep vote failed: {err}");
        }

        let timer_armed = match self.power.arm_wake_timer(interval.as_duration()) {
            Ok(()) => {
                info!("wake timer armed for {interval}");
                true
            }
            Err(err) => {
                warn!("failed to arm wake timer for {interval}: {err}");
                false
            }
        };

        SleepPlan {
            mode,
            interval,
            poller,
            timer_armed,
        }
    }

    pub fn enter_sleep(
        mut self,
        mode: SleepMode,
        interval: ReportingInterval,
        mut poller: PollerHandle,
    ) -> ! {
        self.prepare(mode, interval, &mut poller);
        loop {
            info!("hibernating ...");
            self.power.idle(self.idle_period);
        }
    }

    #[cfg(test)]
    pub(crate) fn power(&self) -> &P {
        &self.power
    }
}

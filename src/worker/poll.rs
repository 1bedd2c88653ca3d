use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

/// Fixed-interval polling that gives up after `max_idle` consecutive idle
/// polls.
#[derive(Debug)]
pub struct IdlePoller {
    interval: Interval,
    max_idle: u32,
    idle: u32,
}

impl IdlePoller {
    pub fn new(period: Duration, max_idle: u32) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            max_idle: max_idle.max(1),
            idle: 0,
        }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Count an idle poll; true once the idle budget is spent.
    pub fn record_idle(&mut self) -> bool {
        self.idle += 1;
        self.idle >= self.max_idle
    }

    pub fn reset(&mut self) {
        self.idle = 0;
    }

    pub fn idle_polls(&self) -> u32 {
        self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_idle() {
        let mut poller = IdlePoller::new(Duration::from_secs(1), 3);
        let start = tokio::time::Instant::now();
        let mut polls = 0;
        loop {
            poller.tick().await;
            polls += 1;
            if poller.record_idle() {
                break;
            }
        }
        assert_eq!(polls, 3);
        // first tick is immediate
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reset_restores_budget() {
        let mut poller = IdlePoller::new(Duration::from_millis(1), 2);
        assert!(!poller.record_idle());
        poller.reset();
        assert_eq!(poller.idle_polls(), 0);
        assert!(!poller.record_idle());
        assert!(poller.record_idle());
    }
}

//! Periodic liveness frames for an open connection.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::stream::client::ConnectionState;
use crate::stream::proto::Packet;

/// Period between liveness frames.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Timer driving keepalive frames.
///
/// The first tick completes one full period after creation.
#[derive(Debug)]
pub struct KeepaliveTimer {
    interval: Interval,
}

impl KeepaliveTimer {
    /// Creates a timer ticking every `period`.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Waits for the next tick.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

impl Default for KeepaliveTimer {
    fn default() -> Self {
        Self::new(KEEPALIVE_INTERVAL)
    }
}

/// Frame to send on a tick, or `None` when the transport is not open.
pub fn liveness_frame(state: ConnectionState) -> Option<Packet> {
    state.is_open().then(Packet::ping)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{timeout, Instant};

    use super::{liveness_frame, KeepaliveTimer, KEEPALIVE_INTERVAL};
    use crate::stream::client::ConnectionState;
    use crate::stream::proto::Packet;

    #[test]
    fn sends_ping_only_while_open() {
        assert_eq!(liveness_frame(ConnectionState::Open), Some(Packet::ping()));
        assert_eq!(
            liveness_frame(ConnectionState::Authenticated),
            Some(Packet::ping())
        );
        assert_eq!(liveness_frame(ConnectionState::Connecting), None);
        assert_eq!(liveness_frame(ConnectionState::Closed), None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_a_full_period() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(KEEPALIVE_INTERVAL);

        let early = timeout(Duration::from_secs(9), timer.tick()).await;
        assert!(early.is_err(), "tick fired before the period elapsed");

        timer.tick().await;
        assert_eq!(start.elapsed(), KEEPALIVE_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_period() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(KEEPALIVE_INTERVAL);

        for expected in 1..=3u32 {
            timer.tick().await;
            assert_eq!(start.elapsed(), KEEPALIVE_INTERVAL * expected);
        }
    }
}

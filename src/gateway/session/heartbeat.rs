use tokio::time::{Duration, Instant};

/// Liveness bookkeeping for one connection.
#[derive(Debug, Default, Clone)]
pub struct HeartbeatState {
    pub ack: bool,
    pub last_ack: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub interval: Option<Duration>,
    pub next_at: Option<Instant>,
    /// Voice heartbeats carry a nonce the ack must echo.
    pub nonce: Option<u64>,
}

impl HeartbeatState {
    /// Starts the interval timer. The first tick lands one interval from now.
    pub fn start(&mut self, interval: Duration, now: Instant) {
        self.ack = true;
        self.last_ack = Some(now);
        self.interval = Some(interval);
        self.next_at = Some(now + interval);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_at.is_some_and(|at| at <= now)
    }

    /// Schedules the tick after the one that just fired.
    pub fn rearm(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            let base = self.next_at.unwrap_or(now);
            let mut next = base + interval;
            if next <= now {
                next = now + interval;
            }
            self.next_at = Some(next);
        }
    }

    pub fn sent(&mut self, now: Instant, nonce: Option<u64>) {
        self.ack = false;
        self.last_sent = Some(now);
        self.nonce = nonce;
    }

    pub fn acked(&mut self, now: Instant) {
        self.ack = true;
        self.last_ack = Some(now);
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        match (self.last_sent, self.last_ack) {
            (Some(sent), Some(ack)) if ack >= sent => Some(ack - sent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ticks_stay_on_schedule() {
        let start = Instant::now();
        let mut hb = HeartbeatState::default();
        assert!(!hb.is_due(start));

        hb.start(Duration::from_millis(100), start);
        assert!(hb.ack);
        assert!(!hb.is_due(start + Duration::from_millis(99)));
        assert!(hb.is_due(start + Duration::from_millis(100)));

        hb.rearm(start + Duration::from_millis(105));
        assert_eq!(hb.next_at, Some(start + Duration::from_millis(200)));

        // A stalled owner doesn't get a burst of overdue ticks.
        hb.rearm(start + Duration::from_millis(450));
        assert_eq!(hb.next_at, Some(start + Duration::from_millis(550)));
    }

    #[test]
    fn latency_follows_send_and_ack() {
        let start = Instant::now();
        let mut hb = HeartbeatState::default();
        hb.sent(start, Some(7));
        assert!(!hb.ack);
        assert_eq!(hb.latency(), None);

        hb.acked(start + Duration::from_millis(40));
        assert_eq!(hb.latency(), Some(Duration::from_millis(40)));
        assert_eq!(hb.nonce, Some(7));
    }
}

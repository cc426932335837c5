use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::bot::BotId;

struct Incident {
    alerted_at: Instant,
    suppressed: usize,
}

/// One alert per bot per window; matches inside the window are only counted.
pub struct Debouncer {
    window: Duration,
    incidents: HashMap<BotId, Incident>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            incidents: HashMap::new(),
        }
    }

    /// Register `matches` new matching lines seen at `now`.
    ///
    /// Returns `Some(suppressed)` when an alert should go out, where
    /// `suppressed` counts the lines swallowed since the previous alert.
    pub fn admit(&mut self, bot: BotId, matches: usize, now: Instant) -> Option<usize> {
        if let Some(incident) = self.incidents.get_mut(&bot)
            && now.saturating_duration_since(incident.alerted_at) < self.window
        {
            incident.suppressed += matches;
            return None;
        }
        let previous = self.incidents.insert(
            bot,
            Incident {
                alerted_at: now,
                suppressed: 0,
            },
        );
        Some(previous.map_or(0, |p| p.suppressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_suppresses_and_then_reports_the_count() {
        let mut debouncer = Debouncer::new(Duration::from_secs(300));
        let t0 = Instant::now();
        let alpha = BotId(1);

        assert_eq!(debouncer.admit(alpha, 3, t0), Some(0));
        assert_eq!(debouncer.admit(alpha, 5, t0 + Duration::from_secs(10)), None);
        assert_eq!(debouncer.admit(alpha, 1, t0 + Duration::from_secs(299)), None);
        assert_eq!(
            debouncer.admit(alpha, 2, t0 + Duration::from_secs(301)),
            Some(6)
        );
    }

    #[test]
    fn bots_are_independent() {
        let mut debouncer = Debouncer::new(Duration::from_secs(300));
        let now = Instant::now();
        assert_eq!(debouncer.admit(BotId(1), 1, now), Some(0));
        assert_eq!(debouncer.admit(BotId(2), 1, now), Some(0));
        assert_eq!(debouncer.admit(BotId(1), 1, now), None);
    }
}

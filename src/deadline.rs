use std::time::{Duration, Instant};

/// An absolute point in time bounding a multi-stage operation.
///
/// Computed once per top-level request and consulted by every later stage as
/// "time remaining".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            // Saturate absurd durations to roughly a century
            expires_at: now
                .checked_add(duration)
                .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600)),
        }
    }

    pub fn at(expires_at: Instant) -> Self {
        Self { expires_at }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    pub fn instant(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn has_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// The earlier of the two deadlines
    pub fn min(self, other: Deadline) -> Deadline {
        if other.expires_at < self.expires_at {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_saturates() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(5));
        assert!(deadline.has_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_counts_down() {
        let deadline = Deadline::from_millis(10_000);
        assert!(!deadline.has_expired());
        assert!(deadline.remaining() <= Duration::from_millis(10_000));
        assert!(deadline.remaining() > Duration::from_millis(9_000));
    }

    #[test]
    fn test_min_picks_earlier() {
        let soon = Deadline::from_millis(10);
        let later = Deadline::from_millis(10_000);
        assert_eq!(soon.min(later), soon);
        assert_eq!(later.min(soon), soon);
    }

    #[test]
    fn test_huge_duration_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.has_expired());
    }
}

//! Wall clock used for windows and delay timestamps.

use tokio::time::Instant;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock anchored to the wall clock at creation and advanced by tokio's timer.
///
/// Follows tokio's paused test clock, so delay timestamps and timer sleeps
/// always agree.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_millis: i64,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_millis: chrono::Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now_millis();

        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(clock.now_millis() - before, 1500);
    }
}

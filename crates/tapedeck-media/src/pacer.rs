use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Opus frame length used when a page carries no timing of its own
pub const NOMINAL_OPUS_FRAME: Duration = Duration::from_millis(20);

/// Throttles a producer to real time.
///
/// Deadlines accumulate from the first unit, so scheduling jitter in one
/// iteration does not shift the rest of the stream.
#[derive(Debug)]
pub struct Pacer {
    fallback: Duration,
    started: Option<Instant>,
    deadline: Option<Instant>,
}

impl Pacer {
    pub fn new(fallback: Duration) -> Self {
        Self {
            fallback,
            started: None,
            deadline: None,
        }
    }

    /// The duration a unit is played for; never zero
    pub fn effective_duration(&self, duration: Duration) -> Duration {
        if duration.is_zero() {
            self.fallback
        } else {
            duration
        }
    }

    /// Sleep until `duration` after the previous deadline has passed
    pub async fn wait(&mut self, duration: Duration) {
        let now = Instant::now();
        let base = self.deadline.unwrap_or(now);
        self.started.get_or_insert(now);

        let deadline = base + self.effective_duration(duration);
        self.deadline = Some(deadline);
        sleep_until(deadline).await;
    }

    /// Wall-clock time since the first unit was paced
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

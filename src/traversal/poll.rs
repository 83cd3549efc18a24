use crate::source::SourceError;
use std::time::Duration;
use tokio::time::Instant;

/// Default sampling interval for every wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default budget for stability and transition waits.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(20);

/// Interval and overall budget of a polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl PollSettings {
    pub fn with_max_wait(self, max_wait: Duration) -> Self {
        Self { max_wait, ..self }
    }
}

/// A running, bounded polling wait.
///
/// Callers loop while [`PollBudget::remaining`] holds, sample their predicate,
/// and [`PollBudget::pause`] between samples. Exhausting the budget is a normal
/// outcome, never an error.
#[derive(Debug)]
pub struct PollBudget {
    started: Instant,
    settings: PollSettings,
}

impl PollBudget {
    pub fn start(settings: PollSettings) -> Self {
        Self {
            started: Instant::now(),
            settings,
        }
    }

    pub fn remaining(&self) -> bool {
        self.started.elapsed() < self.settings.max_wait
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn max_wait_ms(&self) -> u64 {
        self.settings.max_wait.as_millis() as u64
    }

    pub async fn pause(&self) {
        tokio::time::sleep(self.settings.interval).await;
    }
}

/// Treat a transient source failure as "nothing observed this poll".
pub fn observe<T>(result: Result<T, SourceError>) -> Result<Option<T>, SourceError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_transient() => {
            tracing::debug!("poll skipped: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausts_after_max_wait() {
        let budget = PollBudget::start(PollSettings {
            interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(1),
        });
        let mut polls = 0;
        while budget.remaining() {
            polls += 1;
            budget.pause().await;
        }
        assert_eq!(polls, 4);
        assert!(budget.elapsed_ms() >= 1000);
    }

    #[test]
    fn test_observe_swallows_only_transient() {
        assert_eq!(observe::<u8>(Ok(3)).unwrap(), Some(3));
        assert_eq!(observe::<u8>(Err(SourceError::Unavailable("x".into()))).unwrap(), None);
        assert!(observe::<u8>(Err(SourceError::Protocol("x".into()))).is_err());
    }
}

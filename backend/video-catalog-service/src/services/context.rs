use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-call context: the caller's deadline and the correlation id stamped
/// onto every event the call emits.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with a fresh correlation id.
    pub fn generate() -> Self {
        Self::new().with_correlation_id(Uuid::new_v4().to_string())
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Time left for the call: the service default, shortened to the
    /// caller's deadline if that comes first. Zero once the deadline passed.
    pub fn budget(&self, default: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => default.min(deadline.saturating_duration_since(Instant::now())),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_defaults_without_deadline() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.budget(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_budget_is_capped_by_deadline() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));
        assert!(ctx.budget(Duration::from_secs(5)) <= Duration::from_millis(50));
    }

    #[test]
    fn test_expired_deadline_leaves_no_budget() {
        let ctx = RequestContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.budget(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_generate_sets_correlation_id() {
        assert!(RequestContext::generate().correlation_id().is_some());
    }
}

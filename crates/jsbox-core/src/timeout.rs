use std::time::{Duration, Instant};

/// Wall-clock budget of one execution, measured from when the watchdog is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutBudget {
    start: Instant,
    budget: Duration,
}

impl TimeoutBudget {
    pub fn new(budget: Duration) -> Self {
        Self { start: Instant::now(), budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// `None` when the budget reaches past what `Instant` can represent,
    /// which is treated as no deadline at all.
    pub fn deadline(&self) -> Option<Instant> {
        self.start.checked_add(self.budget)
    }

    pub fn expired_at(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.deadline()?.checked_duration_since(now).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::TimeoutBudget;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_budget_expires_immediately() {
        let budget = TimeoutBudget::new(Duration::from_millis(0));
        assert!(budget.expired_at(Instant::now()));
        assert!(budget.remaining_at(Instant::now()).is_none());
    }

    #[test]
    fn remaining_shrinks_towards_deadline() {
        let budget = TimeoutBudget::new(Duration::from_secs(60));
        let now = Instant::now();
        let remaining = budget.remaining_at(now).unwrap_or_default();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
        assert!(!budget.expired_at(now));
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let budget = TimeoutBudget::new(Duration::MAX);
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(budget.deadline().is_none());
        assert!(!budget.expired_at(later));
        assert!(budget.remaining_at(later).is_none());
    }
}

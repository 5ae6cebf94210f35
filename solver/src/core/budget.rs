//! Shared time budget helpers for session orchestration.

use std::time::{Duration, Instant};

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// The tightest of a layer timeout and the remaining session budget.
pub fn tightest(layer: Duration, deadline: Instant) -> Option<Duration> {
    remaining_budget(deadline).map(|remaining| remaining.min(layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_has_no_budget() {
        let deadline = Instant::now() - Duration::from_millis(1);
        assert_eq!(remaining_budget(deadline), None);
        assert_eq!(tightest(Duration::from_secs(5), deadline), None);
    }

    #[test]
    fn layer_timeout_wins_when_tighter() {
        let deadline = Instant::now() + Duration::from_secs(600);
        let budget = tightest(Duration::from_secs(5), deadline).expect("budget");
        assert_eq!(budget, Duration::from_secs(5));
    }

    #[test]
    fn session_deadline_wins_when_tighter() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let budget = tightest(Duration::from_secs(60), deadline).expect("budget");
        assert!(budget <= Duration::from_secs(2));
    }
}

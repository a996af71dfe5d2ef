use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ParseFailure;

/// Cooperative time budget for compilation and parsing.
///
/// Backends call [`Budget::check`] inside their main loops. A budget is
/// exhausted when its deadline passes or when any clone of it is cancelled,
/// which lets a caller that already gave up on the result stop the work at
/// its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Budget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Budget::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Budget {
            deadline: Instant::now().checked_add(timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_exhausted(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), ParseFailure> {
        if self.is_exhausted() {
            Err(ParseFailure::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let budget = Budget::unlimited();
        let worker = budget.clone();
        assert!(worker.check().is_ok());
        budget.cancel();
        assert_eq!(worker.check(), Err(ParseFailure::Interrupted));
    }

    #[test]
    fn zero_timeout_is_exhausted() {
        let budget = Budget::with_timeout(Duration::ZERO);
        assert!(budget.is_exhausted());
    }
}

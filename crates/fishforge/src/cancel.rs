use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Derive a signal that fires on this token or once `timeout` has elapsed.
    pub fn linked(&self, timeout: Option<Duration>) -> LinkedSignal {
        LinkedSignal {
            token: self.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    Cancelled,
    TimedOut,
}

/// Caller cancellation and an optional deadline folded into one signal.
#[derive(Debug, Clone)]
pub struct LinkedSignal {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl LinkedSignal {
    /// User cancellation wins over the timer when both have fired.
    pub fn fired(&self) -> Option<FireReason> {
        if self.token.is_cancelled() {
            return Some(FireReason::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(FireReason::TimedOut),
            _ => None,
        }
    }
}

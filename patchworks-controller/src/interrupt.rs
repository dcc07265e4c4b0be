use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// Cancellation context for reconciles.
///
/// Clones share the interrupted flag. A reconcile checks this before every
/// store call and stops with [`InterruptedError`] once the flag is set or the
/// deadline has passed.
#[derive(Clone, Debug)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterruptedError {
    Interrupted,
    DeadlineExceeded,
}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptedError::Interrupted => write!(f, "interrupted"),
            InterruptedError::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}
impl Error for InterruptedError {}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A view of the same flag that additionally expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        };
        Self {
            interrupted: self.interrupted.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn check_interrupted(&self) -> Result<(), InterruptedError> {
        if self.is_interrupted() {
            return Err(InterruptedError::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(InterruptedError::DeadlineExceeded)
            }
            _ => Ok(()),
        }
    }
}

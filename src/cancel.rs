use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// A cancellation token shared between the pipeline driver and its export
/// workers. Cancellation is requested either explicitly (typically from a
/// SIGTERM/SIGINT handler flipping the shared flag) or implicitly by an
/// ambient deadline expiring. Once cancelled, a token never becomes live
/// again.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that can only be cancelled through [`Self::cancel`] or the
    /// shared flag.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A token wrapping an externally owned flag, e.g. one registered with
    /// signal_hook::flag::register.
    pub fn with_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            deadline: None,
        }
    }

    /// Returns a copy of this token that additionally reports cancellation
    /// once `deadline` has passed. The host environment's invocation
    /// deadline maps onto this.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    /// Request cancellation. Visible to every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested or the deadline has passed.
    /// Checked by the drivers at record boundaries and by workers before
    /// each export call.
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn explicit_cancellation() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[test]
    fn deadline_cancellation() {
        let token = CancellationToken::new();
        let expired = token.with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(expired.is_cancelled());
        // The deadline applies only to the derived token.
        assert!(!token.is_cancelled());

        let live = token.with_deadline(Instant::now() + Duration::from_secs(3600));
        assert!(!live.is_cancelled());
    }

    #[test]
    fn shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::with_flag(Arc::clone(&flag));
        assert!(!token.is_cancelled());
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(token.is_cancelled());
    }
}

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type PipeResult<T> = Result<T, PipeError>;

/// The error kinds distinguished by the runtime core. Would-block is not an
/// error on the data path: `read` and `write` return `Ok(0)` instead.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PipeError {
    /// The caller violated the API contract.
    InvalidArgument,
    /// The module does not implement the requested operation.
    Unsupported,
    /// A pool or slot table is out of capacity.
    Exhausted,
    /// The operation cannot make progress right now. Only control paths
    /// report this; data paths fold it into a zero return.
    Wait,
    /// The module reported an unrecoverable transport error.
    Transport(io::ErrorKind),
    /// The operation failed after ownership of a passed resource moved to
    /// the callee. The caller must not release the resource again.
    TransferFailed,
    /// A service graph failed validation.
    Violation(Violation),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Violation {
    /// The edge set contains a cycle.
    Cycle,
    /// A port slot is used by more than one edge.
    PortInUse,
    /// A source port type is not assignment-compatible with its destination.
    TypeMismatch,
    /// A node or edge ceiling was exceeded.
    TooLarge,
    /// The entry or exit designation is missing or inconsistent with the
    /// edge set.
    BadEndpoint,
    /// A serialized graph references a port the binary no longer defines.
    PortUnknown,
    /// A serialized graph could not be parsed.
    Malformed,
}

impl From<io::Error> for PipeError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => PipeError::Wait,
            kind => PipeError::Transport(kind),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for PipeResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(PipeError::Wait) => false,
            _ => true,
        }
    }
}

/// Cooperative cancellation bit shared between a task and the handles that
/// may cancel it. Flipping it is idempotent; the scheduler checks the bit
/// on every task entry.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[inline]
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: PipeError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, PipeError::Wait);
    }

    #[test]
    fn test_hard_io_error_is_transport() {
        let err: PipeError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, PipeError::Transport(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<u32, PipeError>(0).has_failed());
        assert!(!Err::<u32, _>(PipeError::Wait).has_failed());
        assert!(Err::<u32, _>(PipeError::InvalidArgument).has_failed());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let other = token.clone();

        assert!(!other.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(other.is_cancelled());
    }
}

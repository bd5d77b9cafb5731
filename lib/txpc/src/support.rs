use std::io;

/// Outcome of a public relay call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    /// The operation completed, or there was nothing left to do.
    Done,
    /// Progress was made but the operation is still in flight. The caller
    /// should invoke the entry point again on the next readiness event.
    Inflight,
    /// The call cannot be serviced in the current state.
    BadState,
}

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Eq, PartialEq)]
pub enum RelayError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    IncorrectMsgType,
    UnknownEndpoint,
    Io(io::ErrorKind),
}

impl From<io::Error> for RelayError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => RelayError::Wait,
            kind => RelayError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for RelayResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(RelayError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: RelayError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, RelayError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: RelayError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, RelayError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<_, RelayError>(5).has_failed());
        assert!(!Err::<u8, _>(RelayError::Wait).has_failed());
        assert!(Err::<u8, _>(RelayError::Fatal(ErrorType::IncorrectMsgType)).has_failed());
    }
}

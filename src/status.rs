// ABOUTME: Defines the closed set of outcome codes shared by every fallible core operation
// ABOUTME: Provides a thread-local last-error slot mirroring the legacy C API for diagnostics

use num_enum::TryFromPrimitive;
use std::cell::RefCell;

/// Outcome codes returned by fallible core operations.
///
/// Every operation that can fail resolves to one of these. `Status::Success`
/// is never actually returned from a `Result`-returning function (success is
/// `Ok(..)`); it exists so the thread-local slot in [`last_error`] has a
/// well-defined value before any error has occurred.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    NoMemory = 1,
    Closed = 2,
    Timeout = 3,
    SeeErrno = 4,
    InvalidArgument = 5,
    InternalError = 6,
    NoSpace = 7,
    InputTooLarge = 8,
    ResultTooLarge = 9,
    PermissionDenied = 10,
    Busy = 11,
    NotAvailable = 12,
    NotSupported = 13,
    NotImplemented = 14,
    TryAgain = 15,
    ProtocolError = 16,
    NotFound = 17,
    Canceled = 18,
    OutOfRange = 19,
    Refused = 20,
    TooMany = 21,
    WouldBlock = 22,
}

impl Status {
    /// The numeric code sent to the client in a final `error` instruction.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this status should terminate the connection (§7 severity bands).
    pub fn is_connection_fatal(self) -> bool {
        !matches!(self, Status::Timeout | Status::WouldBlock | Status::TryAgain)
    }

    /// Whether a terminal `error` instruction should be attempted before close.
    ///
    /// Per §7, fatal errors that imply the socket itself is unusable (a write
    /// error after partial progress, or an internal error) skip this step.
    pub fn should_notify_client(self) -> bool {
        !matches!(self, Status::SeeErrno | Status::InternalError)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::NoMemory => "out of memory",
            Status::Closed => "connection closed",
            Status::Timeout => "operation timed out",
            Status::SeeErrno => "see errno",
            Status::InvalidArgument => "invalid argument",
            Status::InternalError => "internal error",
            Status::NoSpace => "no space available",
            Status::InputTooLarge => "input too large",
            Status::ResultTooLarge => "result too large",
            Status::PermissionDenied => "permission denied",
            Status::Busy => "resource busy",
            Status::NotAvailable => "not available",
            Status::NotSupported => "not supported",
            Status::NotImplemented => "not implemented",
            Status::TryAgain => "try again",
            Status::ProtocolError => "protocol error",
            Status::NotFound => "not found",
            Status::Canceled => "canceled",
            Status::OutOfRange => "out of range",
            Status::Refused => "refused",
            Status::TooMany => "too many",
            Status::WouldBlock => "would block",
        };
        f.write_str(text)
    }
}

/// The crate's typed error. Carries a [`Status`] plus a human-readable message,
/// and converts from `std::io::Error` so `?` works across the I/O boundary.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct GuacError {
    pub status: Status,
    pub message: String,
}

impl GuacError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        let error = Self {
            status,
            message: message.into(),
        };
        set_last_error(error.status, error.message.clone());
        error
    }
}

impl From<std::io::Error> for GuacError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let status = match err.kind() {
            ErrorKind::TimedOut => Status::Timeout,
            ErrorKind::WouldBlock => Status::WouldBlock,
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => Status::Closed,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => Status::InvalidArgument,
            _ => Status::SeeErrno,
        };
        GuacError::new(status, err.to_string())
    }
}

pub type GuacResult<T> = Result<T, GuacError>;

thread_local! {
    static LAST_ERROR: RefCell<(Status, String)> = RefCell::new((Status::Success, String::new()));
}

/// Records the most recent error for this thread, mirroring the legacy C
/// `guac_error`/`guac_error_message` globals (§7, §9). Internal code should
/// prefer propagating `GuacError` through `Result`; this exists only as a
/// diagnostic/compatibility surface.
pub fn set_last_error(status: Status, message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = (status, message));
}

/// Returns the most recently recorded `(status, message)` pair for this thread.
pub fn last_error() -> (Status, String) {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_maps_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow peer");
        let err: GuacError = io_err.into();
        assert_eq!(err.status, Status::Timeout);
    }

    #[test]
    fn io_error_maps_eof_to_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: GuacError = io_err.into();
        assert_eq!(err.status, Status::Closed);
    }

    #[test]
    fn new_error_updates_thread_local_slot() {
        let _ = GuacError::new(Status::ProtocolError, "bad opcode");
        let (status, message) = last_error();
        assert_eq!(status, Status::ProtocolError);
        assert_eq!(message, "bad opcode");
    }

    #[test]
    fn fatal_statuses_skip_client_notification() {
        assert!(!Status::InternalError.should_notify_client());
        assert!(!Status::SeeErrno.should_notify_client());
        assert!(Status::ProtocolError.should_notify_client());
    }

    #[test]
    fn recoverable_statuses_are_not_connection_fatal() {
        assert!(!Status::Timeout.is_connection_fatal());
        assert!(!Status::WouldBlock.is_connection_fatal());
        assert!(Status::ProtocolError.is_connection_fatal());
    }
}

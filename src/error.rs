// Error taxonomy shared by every sync pass.
//
//   - I/O failures are fatal to the current object only.
//   - A missing comparison object is data, not failure: callers check
//     `is_no_object_error()` and fall back to an empty hash index.
//   - Protocol/invariant violations are programming errors and are kept
//     distinct so callers fail loudly instead of retrying.

use std::io;

/// errno value for "no such file or directory".
pub const ENOENT: i32 = 2;

/// Code reported for protocol invariant violations.
pub const PROTOCOL_ERROR_CODE: i32 = -2;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    NotFound,
    ProtocolInvariant,
}

/// Errors raised while hashing, matching or reconstructing an object.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The comparison-side object does not exist.
    #[error("{name}: no such object")]
    NotFound { name: String },

    /// Open/read/seek/write failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An internal invariant or the event ordering contract was violated.
    #[error("protocol invariant violated: {0}")]
    Protocol(String),

    /// A wire frame could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    /// Wrap an I/O error, classifying `NotFound` as a missing object.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { name: context }
        } else {
            Self::Io { context, source }
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
            Self::Protocol(_) | Self::Frame(_) => ErrorKind::ProtocolInvariant,
        }
    }

    /// True when the error only says the object is absent.
    pub fn is_no_object_error(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// errno-style code carried by `on_error` events.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => ENOENT,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(-1),
            Self::Protocol(_) | Self::Frame(_) => PROTOCOL_ERROR_CODE,
        }
    }

    /// Rebuild an error from a code received over the wire.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_no_object_error(code) {
            Self::NotFound { name: message }
        } else if code == PROTOCOL_ERROR_CODE {
            Self::Protocol(message)
        } else {
            let source = if code > 0 {
                io::Error::from_raw_os_error(code)
            } else {
                io::Error::other(message.clone())
            };
            Self::Io {
                context: message,
                source,
            }
        }
    }
}

/// Classify an errno-style code: zero and `ENOENT` mean "no object".
pub fn is_no_object_error(code: i32) -> bool {
    code == 0 || code == ENOENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_io_is_classified() {
        let err = SyncError::io("old.bin", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_no_object_error());
        assert_eq!(err.code(), ENOENT);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn other_io_is_not_a_missing_object() {
        let err = SyncError::io("old.bin", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_no_object_error());
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn protocol_errors_are_distinct() {
        let err = SyncError::protocol("hole missing");
        assert_eq!(err.kind(), ErrorKind::ProtocolInvariant);
        assert_eq!(err.code(), PROTOCOL_ERROR_CODE);
        assert!(err.to_string().contains("hole missing"));
    }

    #[test]
    fn code_classification() {
        assert!(is_no_object_error(0));
        assert!(is_no_object_error(ENOENT));
        assert!(!is_no_object_error(13));
    }

    #[test]
    fn from_code_roundtrips_kind() {
        assert_eq!(SyncError::from_code(ENOENT, "x").kind(), ErrorKind::NotFound);
        assert_eq!(
            SyncError::from_code(PROTOCOL_ERROR_CODE, "x").kind(),
            ErrorKind::ProtocolInvariant
        );
        assert_eq!(SyncError::from_code(5, "x").kind(), ErrorKind::Io);
        assert_eq!(SyncError::from_code(-1, "x").kind(), ErrorKind::Io);
    }
}

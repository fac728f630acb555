//! Error kinds shared by the token layer and token handlers.

use thiserror::Error;

/// Closed set of failure kinds a token operation can report.
///
/// Handlers (builtin or external) return these directly; the activation
/// path narrows some of them for external handlers, see
/// [`crate::activate`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid argument")]
    InvalidArgument,

    /// No matching token, keyslot or handler, or validation rejected.
    #[error("not found")]
    NotFound,

    /// Header metadata area or handler registry exhausted.
    #[error("no space left")]
    NoSpace,

    #[error("permission denied")]
    PermissionDenied,

    /// A PIN is required; the caller should prompt and retry.
    #[error("try again")]
    TryAgain,

    /// Backend communication or session failure.
    #[error("access denied")]
    AccessDenied,

    #[error("operation not supported")]
    Unsupported,

    #[error("out of memory")]
    NoMemory,

    /// Backend capability query failed.
    #[error("communication error")]
    CommError,
}

impl TokenError {
    /// Negative errno value for reporting at a process boundary.
    pub fn code(self) -> i32 {
        match self {
            TokenError::InvalidArgument => -22,
            TokenError::NotFound => -2,
            TokenError::NoSpace => -28,
            TokenError::PermissionDenied => -1,
            TokenError::TryAgain => -11,
            TokenError::AccessDenied => -13,
            TokenError::Unsupported => -95,
            TokenError::NoMemory => -12,
            TokenError::CommError => -70,
        }
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let all = [
            TokenError::InvalidArgument,
            TokenError::NotFound,
            TokenError::NoSpace,
            TokenError::PermissionDenied,
            TokenError::TryAgain,
            TokenError::AccessDenied,
            TokenError::Unsupported,
            TokenError::NoMemory,
            TokenError::CommError,
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TokenError::TryAgain.to_string(), "try again");
        assert_eq!(TokenError::NoSpace.to_string(), "no space left");
    }
}

//! Error types shared by the VM, the bridge, and the patch hub
//!
//! Two errors matter at the script boundary:
//! - [`ScriptError`] is what a protected call produces. It is the only error
//!   that crosses from script execution back into host code.
//! - [`BridgeError`] covers marshaling, dispatch, and handle failures. Every
//!   `BridgeError` raised while script code is running is converted into a
//!   `ScriptError`, so callers cannot tell the two apart.

use std::fmt;

use crate::bridge::ObjectHandle;
use crate::host::HostException;

/// Error raised inside script execution.
///
/// Carries the error message and the traceback of script frames that were
/// active when the error was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    /// Error message
    pub message: String,
    /// Frame traceback, innermost first (empty until a frame records it)
    pub traceback: String,
}

impl ScriptError {
    /// Create a script error with an empty traceback
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Attach a traceback unless one was already recorded by an inner frame
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        if self.traceback.is_empty() {
            self.traceback = traceback.into();
        }
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Errors produced by the interop bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Value/type mismatch during marshaling
    #[error("Conversion error: expected {expected}, got {got}")]
    Conversion {
        /// Expected host or script type
        expected: String,
        /// What was actually supplied
        got: String,
    },

    /// No constructor or method accepts the supplied argument shape
    #[error("No matching member `{member}` on {type_name} for ({shape})")]
    NoMatchingMember {
        /// Declaring type name
        type_name: String,
        /// Member name
        member: String,
        /// Argument tags, comma separated
        shape: String,
    },

    /// The only member accepting the arguments expects the other call shape
    #[error("`{member}` on {type_name} must be called as {expected} method")]
    AmbiguousStaticVsInstanceCall {
        /// Declaring type name
        type_name: String,
        /// Member name
        member: String,
        /// "a static" or "an instance"
        expected: &'static str,
    },

    /// Index read/write reached the root type without finding the member
    #[error("Member `{member}` not found on {type_name}")]
    MemberNotFound {
        /// Type the lookup started on
        type_name: String,
        /// Key that was looked up
        member: String,
    },

    /// Use of a released or invalidated handle
    #[error("Stale handle {0}")]
    StaleHandle(ObjectHandle),

    /// `import` of a type the domain does not know
    #[error("Type `{0}` not found")]
    TypeNotFound(String),

    /// Error raised by script code
    #[error("{0}")]
    Script(ScriptError),

    /// Exception thrown by a host method
    #[error("{0}")]
    Host(HostException),

    /// Exception while running a patch (swallowed by the patch hub)
    #[error("Patch `{signature}` failed: {message}")]
    PatchExecutionFailed {
        /// Signature of the patched method
        signature: String,
        /// Failure message
        message: String,
    },
}

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Build a conversion error
    pub fn conversion(expected: impl Into<String>, got: impl Into<String>) -> Self {
        BridgeError::Conversion {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<ScriptError> for BridgeError {
    fn from(err: ScriptError) -> Self {
        BridgeError::Script(err)
    }
}

impl From<HostException> for BridgeError {
    fn from(err: HostException) -> Self {
        BridgeError::Host(err)
    }
}

impl From<BridgeError> for ScriptError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Script(inner) => inner,
            other => ScriptError::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_becomes_script_error() {
        let err: ScriptError = BridgeError::conversion("Int32", "string").into();
        assert_eq!(err.message, "Conversion error: expected Int32, got string");
        assert!(err.traceback.is_empty());
    }

    #[test]
    fn test_script_error_passes_through_unchanged() {
        let original = ScriptError::new("boom").with_traceback("in function 'f'");
        let err: ScriptError = BridgeError::Script(original.clone()).into();
        assert_eq!(err, original);
    }

    #[test]
    fn test_inner_traceback_wins() {
        let err = ScriptError::new("x")
            .with_traceback("inner")
            .with_traceback("outer");
        assert_eq!(err.traceback, "inner");
    }

    #[test]
    fn test_host_exception_message_is_kept() {
        let err: ScriptError =
            BridgeError::Host(HostException::new("ArgumentException", "bad value")).into();
        assert!(err.message.contains("bad value"));
    }
}

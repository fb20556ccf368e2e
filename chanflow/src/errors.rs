//! Error types for the chanflow engine facade.
//!
//! Failures inside a running channel travel as [`crate::outcome::Cause`]
//! trees; this module only covers misuse of the thin typed facade.

use thiserror::Error;

/// The error type for chanflow facade operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A payload held a different type than the caller expected.
    #[error("payload downcast failed: expected `{expected}`, payload holds `{actual}`")]
    PayloadType {
        /// The type the caller asked for.
        expected: &'static str,
        /// The type the payload actually holds.
        actual: &'static str,
    },

    /// No terminal outcome has been recorded yet.
    #[error("no terminal outcome is available; the executor has not finished")]
    OutcomeUnavailable,

    /// No produced value is available.
    #[error("no produced value is available; the last step did not emit")]
    EmissionUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_error_display() {
        let err = EngineError::PayloadType {
            expected: "i32",
            actual: "alloc::string::String",
        };
        assert!(err.to_string().contains("expected `i32`"));
    }
}

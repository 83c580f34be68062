//! # Error Types
//!
//! Domain-specific error types for wiredpart-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  wiredpart-core errors (this file)                                     │
//! │  ├── CoreError        - Record / Change Set model violations           │
//! │  └── ValidationError  - Identifier and field validation failures       │
//! │                                                                         │
//! │  wiredpart-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  wiredpart-sync errors (separate crate)                                │
//! │  └── SyncError        - Lock, folder, protocol and commit failures     │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → status surface        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by the pure sync model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record violates the live/tombstone invariant or has bad identifiers.
    ///
    /// ## When This Occurs
    /// - A peer Change Set carries a record whose table does not match
    ///   the table list it was filed under
    /// - A record id or origin device is empty
    #[error("Invalid record {table}/{record_id}: {reason}")]
    InvalidRecord {
        table: String,
        record_id: String,
        reason: String,
    },

    /// A Change Set document is structurally unusable.
    #[error("Invalid change set from {device_id}: {reason}")]
    InvalidChangeSet { device_id: String, reason: String },

    /// The Change Set was written by a protocol this build does not speak.
    #[error("Unsupported protocol version {found} (supported: {supported})")]
    UnsupportedProtocolVersion { found: u32, supported: u32 },

    /// A stored timestamp could not be converted back into a date.
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g. illegal characters in a device id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Duplicate value inside one Change Set table list.
    #[error("{field} '{value}' appears more than once")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnsupportedProtocolVersion {
            found: 7,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported protocol version 7 (supported: 1)"
        );

        let err = ValidationError::Required {
            field: "device_id".to_string(),
        };
        assert_eq!(err.to_string(), "device_id is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "record_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}

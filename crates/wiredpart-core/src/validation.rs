//! # Validation Module
//!
//! Validation of identifiers and Change Set structure.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Config load                                                  │
//! │  └── validate_device_id, validate_table_name                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Peer Change Set decode                                       │
//! │  ├── Type validation (serde deserialization)                           │
//! │  └── THIS MODULE: validate_change_set                                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Merge                                                        │
//! │  └── Only validated records ever become merge candidates               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Device ids end up inside Change Set file names, so they are restricted
//! to ASCII letters, digits and hyphens.

use std::collections::BTreeSet;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{ChangeSet, Record};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_DEVICE_ID_LEN: usize = 64;
const MAX_TABLE_NAME_LEN: usize = 64;
const MAX_RECORD_ID_LEN: usize = 128;

fn required(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn max_len(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    Ok(())
}

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a device identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - ASCII letters, digits and hyphens only (UUIDs qualify)
///
/// ## Example
/// ```rust
/// use wiredpart_core::validation::validate_device_id;
///
/// assert!(validate_device_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_device_id("laptop.1").is_err());
/// ```
pub fn validate_device_id(device_id: &str) -> ValidationResult<()> {
    required("device_id", device_id)?;
    max_len("device_id", device_id, MAX_DEVICE_ID_LEN)?;

    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ValidationError::InvalidFormat {
            field: "device_id".to_string(),
            reason: "must contain only ASCII letters, digits, and hyphens".to_string(),
        });
    }

    Ok(())
}

/// Validates a synchronized table name (`[a-z0-9_]+`).
pub fn validate_table_name(table: &str) -> ValidationResult<()> {
    required("table_name", table)?;
    max_len("table_name", table, MAX_TABLE_NAME_LEN)?;

    if !table
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "table_name".to_string(),
            reason: "must contain only lowercase letters, digits, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a record identifier.
pub fn validate_record_id(record_id: &str) -> ValidationResult<()> {
    required("record_id", record_id)?;
    max_len("record_id", record_id, MAX_RECORD_ID_LEN)
}

// =============================================================================
// Structural Validators
// =============================================================================

/// Validates one record version.
pub fn validate_record(record: &Record) -> CoreResult<()> {
    let invalid = |reason: String| CoreError::InvalidRecord {
        table: record.table_name.clone(),
        record_id: record.record_id.clone(),
        reason,
    };

    validate_table_name(&record.table_name).map_err(|e| invalid(e.to_string()))?;
    validate_record_id(&record.record_id).map_err(|e| invalid(e.to_string()))?;
    validate_device_id(&record.origin_device).map_err(|e| invalid(e.to_string()))?;

    Ok(())
}

/// Validates a decoded Change Set.
///
/// ## Rules
/// - Publishing device id is valid
/// - Every record sits under the table list it names
/// - No table list appears twice
/// - No record id appears twice within a table
pub fn validate_change_set(change_set: &ChangeSet) -> CoreResult<()> {
    let invalid = |reason: String| CoreError::InvalidChangeSet {
        device_id: change_set.device_id.clone(),
        reason,
    };

    validate_device_id(&change_set.device_id).map_err(|e| invalid(e.to_string()))?;

    let mut tables = BTreeSet::new();
    for table in &change_set.tables {
        if !tables.insert(table.table.as_str()) {
            return Err(invalid(
                ValidationError::Duplicate {
                    field: "table".to_string(),
                    value: table.table.clone(),
                }
                .to_string(),
            ));
        }

        let mut ids = BTreeSet::new();
        for record in &table.records {
            if record.table_name != table.table {
                return Err(invalid(format!(
                    "record {} filed under '{}' but names table '{}'",
                    record.record_id, table.table, record.table_name
                )));
            }
            validate_record(record)?;
            if !ids.insert(record.record_id.as_str()) {
                return Err(invalid(
                    ValidationError::Duplicate {
                        field: "record_id".to_string(),
                        value: record.record_id.clone(),
                    }
                    .to_string(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fields, TableChanges};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("dev-a").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("dev_a").is_err());
        assert!(validate_device_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("purchase_order_items").is_ok());
        assert!(validate_table_name("Parts").is_err());
        assert!(validate_table_name("parts; drop").is_err());
    }

    #[test]
    fn test_change_set_rejects_misfiled_record() {
        let now = Utc.timestamp_millis_opt(10).unwrap();
        let mut cs = ChangeSet::new("dev-a", 1, now);
        cs.tables.push(TableChanges {
            table: "jobs".into(),
            records: vec![Record::live("parts", "P-1", Fields::new(), now, "dev-a")],
        });

        assert!(matches!(
            validate_change_set(&cs),
            Err(CoreError::InvalidChangeSet { .. })
        ));
    }

    #[test]
    fn test_change_set_rejects_duplicate_ids() {
        let now = Utc.timestamp_millis_opt(10).unwrap();
        let mut cs = ChangeSet::new("dev-a", 1, now);
        cs.tables.push(TableChanges {
            table: "parts".into(),
            records: vec![
                Record::live("parts", "P-1", Fields::new(), now, "dev-a"),
                Record::tombstone("parts", "P-1", now, "dev-a"),
            ],
        });

        assert!(validate_change_set(&cs).is_err());
    }

    #[test]
    fn test_valid_change_set_passes() {
        let now = Utc.timestamp_millis_opt(10).unwrap();
        let mut cs = ChangeSet::new("dev-a", 1, now);
        cs.push_table(
            "parts",
            vec![Record::live("parts", "P-1", Fields::new(), now, "dev-b")],
        );
        assert!(validate_change_set(&cs).is_ok());
    }
}

//! # Validation Module
//!
//! Boundary validation for engine requests.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Request structs (serde)                                      │
//! │  └── Shape and types                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Quantities, note lengths, id formats                              │
//! │  └── Group table sets (size, duplicates)                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Engine preconditions (inside the transaction)                │
//! │  └── Table states, membership, pending payments                        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 4: Database (SQLite)                                            │
//! │  └── NOT NULL, UNIQUE, FOREIGN KEY, CHECK                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here runs before a transaction is opened, so a rejected
//! request never touches the database.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::types::NewOrderLine;
use crate::{MAX_ITEM_QUANTITY, MAX_NOTES_LEN, MAX_ORDER_LINES, MIN_GROUP_TABLES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a catalog price in cents. Zero is allowed (complimentary items).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "unit_price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

// =============================================================================
// String Validators
// =============================================================================

/// Validates free-text notes (kitchen notes, rejection reasons).
pub fn validate_notes(field: &str, notes: &str) -> ValidationResult<()> {
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NOTES_LEN,
        });
    }
    Ok(())
}

/// Validates a UUID string format.
///
/// ## Example
/// ```rust
/// use comanda_core::validation::validate_uuid;
///
/// assert!(validate_uuid("table_id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("table_id", "not-a-uuid").is_err());
/// ```
pub fn validate_uuid(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

/// Validates a payment method reference.
pub fn validate_payment_method(method_id: &str) -> ValidationResult<()> {
    if method_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "payment_method_id".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates the lines of an AddOrder request.
///
/// ## Rules
/// - At least one line
/// - At most MAX_ORDER_LINES lines
/// - Every line has a product id, a valid quantity and bounded notes
pub fn validate_order_lines(lines: &[NewOrderLine]) -> ValidationResult<()> {
    if lines.is_empty() {
        return Err(ValidationError::Required {
            field: "lines".to_string(),
        });
    }

    if lines.len() > MAX_ORDER_LINES {
        return Err(ValidationError::OutOfRange {
            field: "lines".to_string(),
            min: 1,
            max: MAX_ORDER_LINES as i64,
        });
    }

    for line in lines {
        if line.product_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "product_id".to_string(),
            });
        }
        validate_quantity(line.quantity)?;
        if let Some(notes) = &line.notes {
            validate_notes("notes", notes)?;
        }
    }

    Ok(())
}

/// Validates the table set of a group.
///
/// ## Rules
/// - At least MIN_GROUP_TABLES tables
/// - No table listed twice
pub fn validate_group_tables(table_ids: &[String]) -> ValidationResult<()> {
    if table_ids.len() < MIN_GROUP_TABLES {
        return Err(ValidationError::TooFew {
            field: "table_ids".to_string(),
            min: MIN_GROUP_TABLES,
        });
    }

    let mut seen = HashSet::with_capacity(table_ids.len());
    for id in table_ids {
        if id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "table_id".to_string(),
            });
        }
        if !seen.insert(id.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "table_id".to_string(),
                value: id.clone(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

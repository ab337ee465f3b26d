//! Error types and constructors for the policy analysis engine.
//!
//! This module provides error construction functions that create properly
//! formatted [`AppError`] instances with context-specific messages.
//!
//! # Error Categories
//!
//! - **Input errors**: out-of-range ids, attributes where a type is required
//! - **Permission-map errors**: information-flow queries without a loaded map
//! - **Policy-version errors**: features requiring a newer policy version
//! - **Conditional errors**: malformed RPN expressions
//! - **Config errors**: invalid configuration files or values

pub use masterror::{AppError, AppResult};

/// Create an invalid-input error with context.
///
/// Used for null-equivalent arguments, out-of-range ids and an attribute
/// passed where a type is required.
pub fn invalid_input_error(message: impl Into<String>) -> AppError {
    AppError::bad_request(message.into())
}

/// Create an error for an invalid analysis start type.
pub fn invalid_start_error(type_id: usize) -> AppError {
    AppError::bad_request(format!(
        "Invalid start type {}: must be a valid non-self type, never an attribute",
        type_id
    ))
}

/// Create an error for an information-flow query without a permission map.
pub fn missing_perm_map_error() -> AppError {
    AppError::bad_request(String::from(
        "A permission map must be loaded before running information-flow queries"
    ))
}

/// Create an error for a feature unavailable at the policy's version.
pub fn unsupported_policy_error(version: u32, required: u32) -> AppError {
    AppError::bad_request(format!(
        "Policy version {} does not support this feature (requires version >= {})",
        version, required
    ))
}

/// Create an error for a malformed conditional expression.
///
/// # Notes
///
/// - Evaluation of malformed conditionals silently yields `false`; this
///   error is only raised by entry points that validate expressions up front.
pub fn malformed_cond_error(message: impl Into<String>) -> AppError {
    AppError::bad_request(format!("Malformed conditional expression: {}", message.into()))
}

/// Create an error for a direction not valid for the requested analysis.
pub fn bad_direction_error(message: impl Into<String>) -> AppError {
    AppError::bad_request(message.into())
}

/// Create an error for an aborted path-search iterator.
pub fn truncated_error() -> AppError {
    AppError::bad_request(String::from(
        "Path search was aborted; no further results are available"
    ))
}

/// Create a structural-inconsistency error.
///
/// Raised during index or table construction when the policy view references
/// an unknown permission, class or out-of-range type.
pub fn inconsistent_policy_error(message: impl Into<String>) -> AppError {
    AppError::internal(format!("Inconsistent policy view: {}", message.into()))
}

/// Create config error
pub fn config_error(message: impl Into<String>) -> AppError {
    AppError::bad_request(message.into())
}

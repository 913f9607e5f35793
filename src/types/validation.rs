//! Input validation for queue and table names.

use crate::error::ValidationError;

/// Maximum accepted queue name length.
pub const MAX_QUEUE_NAME_LENGTH: usize = 200;

/// Validate a queue name.
///
/// Queue names must be non-empty, at most [`MAX_QUEUE_NAME_LENGTH`] characters
/// and free of control characters.
pub fn validate_queue_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidQueueName(
            "must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(ValidationError::InvalidQueueName(format!(
            "exceeds maximum length of {} characters",
            MAX_QUEUE_NAME_LENGTH
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidQueueName(
            "must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate a table name before it is interpolated into SQL statements.
///
/// Only plain identifiers are accepted: a letter or underscore followed by
/// letters, digits or underscores.
pub fn validate_table_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest {
        return Err(ValidationError::InvalidTableName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_queue_names() {
        assert!(validate_queue_name("TestQueue").is_ok());
        assert!(validate_queue_name("orders:shipping").is_ok());
        assert!(validate_queue_name("queue-1.eu").is_ok());
    }

    #[test]
    fn test_empty_queue_name_rejected() {
        assert!(validate_queue_name("").is_err());
    }

    #[test]
    fn test_overlong_queue_name_rejected() {
        let name = "q".repeat(MAX_QUEUE_NAME_LENGTH + 1);
        assert!(validate_queue_name(&name).is_err());
    }

    #[test]
    fn test_control_characters_rejected() {
        assert!(validate_queue_name("queue\nname").is_err());
    }

    #[test]
    fn test_valid_table_names() {
        assert!(validate_table_name("durable_queue_messages").is_ok());
        assert!(validate_table_name("_queue2").is_ok());
    }

    #[test]
    fn test_injection_prone_table_names_rejected() {
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1queue").is_err());
        assert!(validate_table_name("queue;--").is_err());
        assert!(validate_table_name("queue messages").is_err());
    }
}

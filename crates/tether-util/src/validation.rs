use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
}

/// Event names: dotted/dashed lowercase identifiers, e.g. `chat-message`
/// or `presence.update`.
pub fn validate_event_name(name: &str) -> Result<(), ValidationError> {
    let len = name.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 64 {
        return Err(ValidationError::TooLong { max: 64, got: len });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Room ids double as store key segments and broadcast group names, so the
/// key separator `:` is rejected.
pub fn validate_room_id(id: &str) -> Result<(), ValidationError> {
    let len = id.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 64 {
        return Err(ValidationError::TooLong { max: 64, got: len });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

pub fn validate_room_name(name: &str) -> Result<(), ValidationError> {
    let len = name.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 100 {
        return Err(ValidationError::TooLong { max: 100, got: len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_allow_dots_and_dashes() {
        assert!(validate_event_name("chat-message").is_ok());
        assert!(validate_event_name("presence.update_v2").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("has space").is_err());
        assert!(validate_event_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn room_ids_reject_key_separators() {
        assert!(validate_room_id("lobby").is_ok());
        assert!(validate_room_id("room_42").is_ok());
        assert!(validate_room_id("a:b").is_err());
        assert!(validate_room_id("").is_err());
    }
}

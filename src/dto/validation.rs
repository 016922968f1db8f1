//! Validation helpers for inbound payloads.

use validator::ValidationError;

/// Shortest accepted nickname, in characters.
const NICKNAME_MIN: usize = 2;
/// Longest accepted nickname, in characters.
const NICKNAME_MAX: usize = 24;

/// Validates that a nickname is 2-24 visible characters with no control codes.
///
/// # Examples
///
/// ```ignore
/// validate_nickname("daisy")      // Ok
/// validate_nickname(" daisy ")    // Ok - surrounding whitespace is the caller's concern
/// validate_nickname("d")          // Err - too short
/// validate_nickname("a\nb")       // Err - control character
/// ```
pub fn validate_nickname(nickname: &str) -> Result<(), ValidationError> {
    let length = nickname.trim().chars().count();
    if !(NICKNAME_MIN..=NICKNAME_MAX).contains(&length) {
        let mut err = ValidationError::new("nickname_length");
        err.message = Some(
            format!("Nickname must be {NICKNAME_MIN}-{NICKNAME_MAX} characters (got {length})")
                .into(),
        );
        return Err(err);
    }

    if nickname.chars().any(char::is_control) {
        let mut err = ValidationError::new("nickname_format");
        err.message = Some("Nickname must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_nickname_valid() {
        assert!(validate_nickname("daisy").is_ok());
        assert!(validate_nickname("Player One").is_ok());
        assert!(validate_nickname("ab").is_ok());
    }

    #[test]
    fn test_validate_nickname_invalid_length() {
        assert!(validate_nickname("d").is_err()); // too short
        assert!(validate_nickname("").is_err()); // empty
        assert!(validate_nickname(&"x".repeat(25)).is_err()); // too long
        assert!(validate_nickname("   ").is_err()); // whitespace only
    }

    #[test]
    fn test_validate_nickname_invalid_format() {
        assert!(validate_nickname("a\nb").is_err()); // newline
        assert!(validate_nickname("a\tbc").is_err()); // tab
    }
}

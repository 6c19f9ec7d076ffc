//! Registration input validators.
//!
//! Pure functions; the returned reason is safe to show to the user who
//! submitted the input.

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 30;
pub const EMAIL_MAX_LEN: usize = 254;
pub const PASSWORD_MIN_LEN: usize = 8;
pub const PASSWORD_MAX_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub &'static str);

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(ValidationError("Username must be 3-30 characters"));
    }
    if !username.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(ValidationError("Username must start with a letter"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ValidationError(
            "Username may only contain letters, digits, and underscores",
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() || email.len() > EMAIL_MAX_LEN {
        return Err(ValidationError("Email must be 1-254 characters"));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(ValidationError("Email must not contain whitespace"));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError("Email must contain '@'"));
    };
    if local.is_empty() || domain.contains('@') {
        return Err(ValidationError("Email address is malformed"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(ValidationError("Email domain is malformed"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if !(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&len) {
        return Err(ValidationError("Password must be 8-128 characters"));
    }
    if !password.chars().any(|c| c.is_alphabetic()) {
        return Err(ValidationError("Password must contain a letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError("Password must contain a digit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_username() {
        assert!(validate_username("abc123").is_ok());
        assert!(validate_username("a_b").is_ok());
        assert!(validate_username(&format!("a{}", "b".repeat(29))).is_ok());
    }

    #[test]
    fn test_invalid_username() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"a".repeat(31)).is_err());
        assert!(validate_username("1abc").is_err());
        assert!(validate_username("_abc").is_err());
        assert!(validate_username("abc-def").is_err());
        assert!(validate_username("abc def").is_err());
        assert!(validate_username("ábc123").is_err());
    }

    #[test]
    fn test_username_reason_is_specific() {
        assert_eq!(
            validate_username("9lives").unwrap_err().to_string(),
            "Username must start with a letter"
        );
    }

    #[test]
    fn test_valid_email() {
        assert!(validate_email("abc@example.com").is_ok());
        assert!(validate_email("a.b+tag@mail.example.co").is_ok());
    }

    #[test]
    fn test_invalid_email() {
        assert!(validate_email("").is_err());
        assert!(validate_email("abc").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("abc@example").is_err());
        assert!(validate_email("abc@example.").is_err());
        assert!(validate_email("abc@@example.com").is_err());
        assert!(validate_email("a bc@example.com").is_err());
        assert!(validate_email(&format!("{}@example.com", "a".repeat(250))).is_err());
    }

    #[test]
    fn test_valid_password() {
        assert!(validate_password("password1").is_ok());
        assert!(validate_password("1234567a").is_ok());
    }

    #[test]
    fn test_invalid_password() {
        assert!(validate_password("pass1").is_err());
        assert!(validate_password("password").is_err());
        assert!(validate_password("12345678").is_err());
        assert!(validate_password(&format!("a1{}", "x".repeat(127))).is_err());
        assert_eq!(
            validate_password("passwords").unwrap_err(),
            ValidationError("Password must contain a digit")
        );
    }
}

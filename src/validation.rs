// Validation utilities module
// Custom validator functions for booking requests

use regex::Regex;
use std::sync::OnceLock;
use validator::ValidationError;

fn phone_pattern() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    // Local 0xxxxxxxxx or international +84xxxxxxxxx
    PHONE.get_or_init(|| Regex::new(r"^(\+84|0)[1-9][0-9]{8,9}$").expect("phone pattern is a valid regex"))
}

/// Validates that a phone number is a plausible Vietnamese mobile/landline number
pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let compact: String = phone.chars().filter(|c| !c.is_whitespace() && *c != '.').collect();
    if phone_pattern().is_match(&compact) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_phone"))
    }
}

use crate::CoreError;

const MIN_NATIONAL_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Normalizes a raw phone input into canonical digits with a country code.
///
/// Strips every non-digit character, then prefixes `country_code` unless the
/// number already starts with it. Inputs like `"(11) 99999-8888"`,
/// `"11999998888"` and `"+5511999998888"` all normalize to the same value
/// for country code `55`.
///
/// ```
/// use trimline_core::normalize_recipient;
///
/// let n = normalize_recipient("(11) 99999-8888", "55").unwrap();
/// assert_eq!(n, "5511999998888");
/// assert_eq!(normalize_recipient("+5511999998888", "55").unwrap(), n);
/// ```
pub fn normalize_recipient(raw: &str, country_code: &str) -> Result<String, CoreError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_NATIONAL_DIGITS {
        return Err(CoreError::InvalidRecipient(format!(
            "`{raw}` has too few digits"
        )));
    }
    let normalized = if digits.starts_with(country_code) {
        digits
    } else {
        format!("{country_code}{digits}")
    };
    if normalized.len() > MAX_DIGITS {
        return Err(CoreError::InvalidRecipient(format!(
            "`{raw}` has too many digits"
        )));
    }
    Ok(normalized)
}

// Request field validation for the HTTP front door
// Pure functions over decoded JSON values; error Display text is the 400 body

use serde_json::Value;
use thiserror::Error;

/// Upper bound for prompts accepted by `POST /agent/start`
pub const MAX_PROMPT_LEN: usize = 10_000;
/// Upper bound for task ids, repo ids and choice ids
pub const MAX_ID_LEN: usize = 128;
/// Upper bound for log messages and summaries
pub const MAX_MESSAGE_LEN: usize = 5_000;

/// A field failed validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be a {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("{field} exceeds maximum length of {max}")]
    TooLong { field: String, max: usize },

    #[error("{field} must be one of: {allowed}")]
    NotAllowed { field: String, allowed: String },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: f64, max: f64 },
}

/// Validate a required string field.
///
/// Missing, `null` and `""` are all "required"; length is counted in
/// characters and a string of exactly `max_len` is accepted.
pub fn validate_string<'a>(
    value: Option<&'a Value>,
    field: &str,
    max_len: usize,
) -> Result<&'a str, ValidationError> {
    let s = match value {
        None | Some(Value::Null) => return Err(required(field)),
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: field.to_string(),
                expected: "string",
            })
        }
    };

    if s.is_empty() {
        return Err(required(field));
    }
    if s.chars().count() > max_len {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: max_len,
        });
    }
    Ok(s)
}

/// Validate an optional string field: absent or `null` is `Ok(None)`,
/// anything present must pass [`validate_string`]
pub fn validate_optional_string<'a>(
    value: Option<&'a Value>,
    field: &str,
    max_len: usize,
) -> Result<Option<&'a str>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => validate_string(Some(v), field, max_len).map(Some),
    }
}

/// Validate a required string that must be one of `allowed`
pub fn validate_enum<'a>(
    value: Option<&'a Value>,
    field: &str,
    allowed: &[&str],
) -> Result<&'a str, ValidationError> {
    let s = validate_string(value, field, usize::MAX)?;
    if allowed.contains(&s) {
        Ok(s)
    } else {
        Err(ValidationError::NotAllowed {
            field: field.to_string(),
            allowed: allowed.join(", "),
        })
    }
}

/// Validate an optional boolean field
pub fn validate_optional_bool(
    value: Option<&Value>,
    field: &str,
) -> Result<Option<bool>, ValidationError> {
    match value {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: "boolean",
        }),
    }
}

/// Validate a required number within `[min, max]`.
///
/// Numeric strings (`"42"`) are accepted, matching what query strings and
/// loosely typed clients send.
pub fn validate_number(
    value: Option<&Value>,
    field: &str,
    min: f64,
    max: f64,
) -> Result<f64, ValidationError> {
    let n = match value {
        None | Some(Value::Null) => return Err(required(field)),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Err(required(field)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    let n = n.filter(|n| n.is_finite()).ok_or_else(|| ValidationError::WrongType {
        field: field.to_string(),
        expected: "number",
    })?;

    if n < min || n > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
        });
    }
    Ok(n)
}

fn required(field: &str) -> ValidationError {
    ValidationError::Required {
        field: field.to_string(),
    }
}

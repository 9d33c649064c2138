use std::fmt;

use thiserror::Error;

use crate::Value;

/// Stable error categories. The names are part of the observable
/// contract: scripts and tests match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    Exists,
    InvalidValue,
    Allocation,
    PointerRegistration,
    NumArgs,
    OperFailed,
    /// Raised by the called function's own error reporting (`onerror`
    /// default handler, errno text) or by user commands.
    Failed,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Exists => "Exists",
            Self::InvalidValue => "InvalidValue",
            Self::Allocation => "Allocation",
            Self::PointerRegistration => "PointerRegistration",
            Self::NumArgs => "NumArgs",
            Self::OperFailed => "OperFailed",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct AlienError {
    pub code: ErrorCode,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, AlienError>;

impl AlienError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: &str, name: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{what} \"{name}\" not found or inaccessible."),
        )
    }

    pub fn exists(what: &str, name: &str) -> Self {
        Self::new(
            ErrorCode::Exists,
            format!("{what} \"{name}\" already exists with a different definition."),
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidValue, message)
    }

    /// Invalid value error echoing the offending value. Binary data is
    /// never echoed back.
    pub fn invalid_value(message: &str, value: &Value) -> Self {
        match value {
            Value::Bytes(_) => Self::invalid(message.to_string()),
            other => Self::invalid(format!(
                "{message} Invalid value \"{}\".",
                other.to_string_lossy_short()
            )),
        }
    }

    pub fn wrong_type(expected: &str, value: &Value) -> Self {
        Self::invalid_value(&format!("Expected {expected}."), value)
    }

    pub fn range(what: &str, value: &Value) -> Self {
        Self::invalid_value(
            &format!("Value out of range for type {what}."),
            value,
        )
    }

    pub fn null_not_allowed() -> Self {
        Self::invalid("Null pointer not allowed.")
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Allocation, message)
    }

    pub fn tag_mismatch(expected: &str, value: &Value) -> Self {
        Self::new(
            ErrorCode::PointerRegistration,
            format!(
                "Pointer type mismatch, expected \"{expected}\", got \"{value}\"."
            ),
        )
    }

    pub fn not_registered(value: &Value) -> Self {
        Self::new(
            ErrorCode::PointerRegistration,
            format!("Pointer \"{value}\" is not registered."),
        )
    }

    pub fn encoding(encoding: &str) -> Self {
        Self::invalid(format!(
            "Text cannot be represented in encoding \"{encoding}\"."
        ))
    }

    pub fn num_args(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NumArgs, message)
    }

    pub fn oper_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperFailed, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failed, message)
    }

    /// Prefix the message with context, keeping the category.
    pub fn context(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix} {}", self.message);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_values_are_not_echoed() {
        let err = AlienError::invalid_value("Bad.", &Value::Bytes(vec![0, 1]));
        assert_eq!(err.message, "Bad.");
        let err = AlienError::invalid_value("Bad.", &Value::from("x y"));
        assert_eq!(err.message, "Bad. Invalid value \"x y\".");
        assert_eq!(err.code.name(), "InvalidValue");
    }

    #[test]
    fn context_keeps_category() {
        let err = AlienError::not_found("Struct", "Point").context("Field a:");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.starts_with("Field a: Struct \"Point\""));
    }
}

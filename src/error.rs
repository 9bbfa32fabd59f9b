use crate::format::StatusCode;
use thiserror::Error;

/// A terminal request failure: a status code plus the text reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ExportError {
    code: StatusCode,
    message: String,
}

impl ExportError {
    /// Registry text for `code`.
    pub fn from_code(code: StatusCode) -> Self {
        Self {
            code,
            message: code.message().unwrap_or_default().to_string(),
        }
    }

    /// Registry text followed by a parenthesized detail, e.g.
    /// `invalid or malformed request syntax (empty markdown)`.
    pub fn with_extra(code: StatusCode, extra: impl AsRef<str>) -> Self {
        let base = code.message().unwrap_or_default();
        Self {
            code,
            message: format!("{base} ({})", extra.as_ref()),
        }
    }

    /// A contextual message that replaces the registry text.
    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

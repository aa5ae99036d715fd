use crate::result_code;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LdapError {
    /// Failure reported by the session layer or a non-success result code.
    #[error("{text} ({code})")]
    Protocol { code: i32, text: String },

    /// No message arrived before the deadline.
    #[error("Timed out")]
    Timeout,

    #[error("Out of memory")]
    OutOfMemory,

    /// A field the protocol guarantees was missing or unusable.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

impl LdapError {
    /// Protocol error carrying the standard rendering of `code`.
    pub fn protocol(code: i32) -> Self {
        LdapError::Protocol {
            code,
            text: result_code::err2string(code).to_string(),
        }
    }

    pub fn protocol_with_text(code: i32, text: impl Into<String>) -> Self {
        LdapError::Protocol {
            code,
            text: text.into(),
        }
    }

    /// Numeric LDAP or client-library code for this error.
    pub fn code(&self) -> i32 {
        match self {
            LdapError::Protocol { code, .. } => *code,
            LdapError::Timeout => result_code::TIMEOUT,
            LdapError::OutOfMemory => result_code::NO_MEMORY,
            LdapError::MalformedMessage(_) => result_code::DECODING_ERROR,
        }
    }

    /// Whether re-running the whole operation could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LdapError::OutOfMemory | LdapError::MalformedMessage(_))
    }
}

impl From<std::io::Error> for LdapError {
    fn from(err: std::io::Error) -> Self {
        LdapError::Protocol {
            code: result_code::SERVER_DOWN,
            text: format!("{}: {}", result_code::err2string(result_code::SERVER_DOWN), err),
        }
    }
}

impl From<std::collections::TryReserveError> for LdapError {
    fn from(_: std::collections::TryReserveError) -> Self {
        LdapError::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;

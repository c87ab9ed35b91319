use super::wire::{Status, StatusCode};
use crate::error::ConnectionError;
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SftpError {
    #[error("SFTP session has already been closed")]
    ConnectionClosed,

    #[error("incorrect response type")]
    InvalidResponse,

    #[error("the response carried no entry")]
    MissingResponse,

    #[error("unsupported SFTP protocol version {}", _0)]
    UnsupportedVersion(u32),

    #[error("protocol error: {}", msg)]
    Protocol { msg: Cow<'static, str> },

    #[error("from remote: {}", _0)]
    Status(#[source] StatusError),

    #[error("errored in the connection")]
    Connection(
        #[from]
        #[source]
        ConnectionError,
    ),
}

impl SftpError {
    pub(crate) fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        SftpError::Protocol { msg: msg.into() }
    }
}

/// A status reply other than `OK` or `EOF`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct StatusError {
    code: StatusCode,
    message: String,
    language_tag: String,
}

impl StatusError {
    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn language_tag(&self) -> &str {
        &self.language_tag
    }
}

impl From<Status> for StatusError {
    fn from(status: Status) -> Self {
        Self {
            code: status.code,
            message: status.message,
            language_tag: status.language_tag,
        }
    }
}

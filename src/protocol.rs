//! Outbound message protocol
//!
//! One JSON text frame per message, shaped `{ "type", "message", "file"? }`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Job-level status carried by `code` messages
///
/// The integer values are part of the wire contract with existing clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Job accepted and engine launched
    StartEval,

    /// Engine finished and the job is considered successful
    Success,

    /// Engine (or the job around it) failed
    Error,
}

impl StatusCode {
    /// Wire value of the status code
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::StartEval => 301,
            Self::Success => 401,
            Self::Error => 501,
        }
    }

    /// Parse a wire value
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            301 => Some(Self::StartEval),
            401 => Some(Self::Success),
            501 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this code ends a job
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Some clients echo the code back as a decimal string
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        let value = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(s) => s
                .trim()
                .parse::<u16>()
                .map_err(|e| serde::de::Error::custom(format!("invalid status code {:?}: {}", s, e)))?,
        };

        Self::from_u16(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code: {}", value)))
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    /// Job succeeded
    Success,
    /// Job failed
    Error,
}

impl From<TerminalStatus> for StatusCode {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Success => Self::Success,
            TerminalStatus::Error => Self::Error,
        }
    }
}

/// A single unit of the outbound message stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    /// Job status transition
    Code {
        /// Status code, an integer on the wire (`301`, `401`, `501`)
        message: StatusCode,
    },

    /// Engine standard output or job progress
    Log {
        /// Decoded text
        message: String,
    },

    /// Engine standard error or a job-level failure
    Error {
        /// Decoded text or failure description
        message: String,
    },

    /// Contents of a result artifact
    Result {
        /// Artifact file name
        file: String,

        /// Full artifact contents
        message: String,
    },
}

impl ProtocolMessage {
    /// `code` message
    pub fn code(status: impl Into<StatusCode>) -> Self {
        Self::Code {
            message: status.into(),
        }
    }

    /// `log` message
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    /// `error` message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// `result` message
    pub fn result(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Result {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Wire tag of this message
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Code { .. } => "code",
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
            Self::Result { .. } => "result",
        }
    }

    /// Status code if this is a `code` message
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Code { message } => Some(*message),
            _ => None,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame
    pub fn from_json(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

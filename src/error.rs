//! Error handling for Switchboard

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registration interval too brief (minimum {min_expires}s)")]
    IntervalTooBrief { min_expires: u32 },

    #[error("No contacts registered for {0}")]
    NoContacts(String),

    #[error("Call rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("No available media nodes")]
    NoAvailableMembers,

    #[error("Session belongs to an outbound leg; migrated with its A-leg")]
    SkipBLeg,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn rtp<S: Into<String>>(msg: S) -> Self {
        Self::Rtp(msg.into())
    }

    pub fn media<S: Into<String>>(msg: S) -> Self {
        Self::Media(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// SIP status code this error maps to when it has to be surfaced to a
    /// peer (REGISTER and INVITE UAS paths).
    pub fn sip_status(&self) -> u16 {
        match self {
            Error::IntervalTooBrief { .. } => 423,
            Error::NoContacts(_) | Error::NotFound(_) => 404,
            Error::Rejected { code, .. } => *code,
            Error::Timeout(_) => 408,
            Error::InvalidState(_) => 481,
            Error::Parse(_) => 400,
            _ => 500,
        }
    }
}

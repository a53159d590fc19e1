use std::fmt;

/// Coarse failure categories callers branch on (download vs. extraction vs. policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    TooLarge,
    Integrity,
    PathTraversal,
    MissingLayout,
    DisallowedOutput,
    Busy,
    Cancelled,
    Config,
    Io,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::TooLarge => "too-large",
            ErrorKind::Integrity => "integrity",
            ErrorKind::PathTraversal => "path-traversal",
            ErrorKind::MissingLayout => "missing-layout",
            ErrorKind::DisallowedOutput => "disallowed-output",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Other => "other",
        }
    }

    /// Security violations abort a run immediately instead of degrading it.
    pub fn is_hard_failure(self) -> bool {
        matches!(self, ErrorKind::PathTraversal | ErrorKind::DisallowedOutput)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::Config, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Config, format!("json error: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::new(ErrorKind::Io, format!("archive error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::new(ErrorKind::Network, format!("http error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

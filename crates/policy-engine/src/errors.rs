use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no policy loaded for path: {0}")]
    NotLoaded(String),
    #[error("policy input of {size} bytes exceeds the {limit} byte limit")]
    InputTooLarge { size: usize, limit: usize },
    #[error("failed to serialize policy input: {0}")]
    Serialize(String),
    #[error("failed to compile policy {origin}: {message}")]
    Compile { origin: String, message: String },
    #[error("no policy sources found in {0}")]
    NoSources(String),
    #[error("invalid bundle {0}")]
    Bundle(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error("storage write failed at {path}: {message}")]
    Store { path: String, message: String },
    #[error("data at {path} conflicts with policy package data.{package}")]
    Conflict { path: String, package: String },
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
    #[error("policy evaluation exceeded the {0} ms deadline")]
    Timeout(u64),
}

impl PolicyError {
    /// Errors caused by the caller's input rather than the engine.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            PolicyError::InputTooLarge { .. } | PolicyError::Serialize(_)
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, PolicyError::NotLoaded(_))
    }

    /// Decision outcome recorded when this error ends an evaluation.
    pub fn outcome(&self) -> &'static str {
        if self.is_unavailable() {
            "unavailable"
        } else if self.is_protocol() {
            "invalid_input"
        } else {
            "evaluation_error"
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PolicyError::NotLoaded(_) => "not_loaded",
            PolicyError::InputTooLarge { .. } => "input_too_large",
            PolicyError::Serialize(_) => "serialize",
            PolicyError::Compile { .. } => "compile",
            PolicyError::NoSources(_) => "no_sources",
            PolicyError::Bundle(_) => "bundle",
            PolicyError::Io(_) => "io",
            PolicyError::InvalidPath(_) => "invalid_path",
            PolicyError::Store { .. } => "store",
            PolicyError::Conflict { .. } => "conflict",
            PolicyError::Evaluation(_) => "evaluation",
            PolicyError::Timeout(_) => "timeout",
        }
    }
}

impl From<std::io::Error> for PolicyError {
    fn from(value: std::io::Error) -> Self {
        PolicyError::Io(value.to_string())
    }
}

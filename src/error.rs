use std::fmt;

#[derive(Debug)]
pub enum PipelineError {
    /// A precondition of the pipeline does not hold (empty group, missing archive, ...).
    Integrity(String),
    CorruptArchive(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Io(std::io::Error),
    Filter { filter: String, reason: String },
    Config(String),
    Worker(String),
    Other(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Integrity(e) => write!(f, "Integrity violation: {}", e),
            PipelineError::CorruptArchive(e) => write!(f, "Corrupt archive: {}", e),
            PipelineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PipelineError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
            PipelineError::Filter { filter, reason } => {
                write!(f, "Filter '{}' failed: {}", filter, reason)
            }
            PipelineError::Config(e) => write!(f, "Configuration error: {}", e),
            PipelineError::Worker(e) => write!(f, "Worker error: {}", e),
            PipelineError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(e) => Some(e),
            PipelineError::Serialization(e) => Some(e.as_ref()),
            PipelineError::Deserialization(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl PipelineError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        PipelineError::Integrity(msg.into())
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, PipelineError::Integrity(_))
    }
}

impl From<bincode::error::EncodeError> for PipelineError {
    fn from(err: bincode::error::EncodeError) -> Self {
        PipelineError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for PipelineError {
    fn from(err: bincode::error::DecodeError) -> Self {
        PipelineError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<walkdir::Error> for PipelineError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => PipelineError::Io(io),
            None => PipelineError::Other("filesystem loop while walking archives".to_string()),
        }
    }
}

impl From<String> for PipelineError {
    fn from(err: String) -> Self {
        PipelineError::Other(err)
    }
}

impl From<&str> for PipelineError {
    fn from(err: &str) -> Self {
        PipelineError::Other(err.to_string())
    }
}

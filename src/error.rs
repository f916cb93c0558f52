use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed user setting (hex offset, range, depth, pattern).
    #[error("config error: {0}")]
    Config(String),

    /// The executable could not be loaded or has nothing to scan.
    #[error("loader error: {0}")]
    Loader(String),

    /// A chain goal could not be met with the discovered gadgets.
    #[error("cannot build chain: {requirement}")]
    Synthesis { requirement: String },

    /// An optional external tool is missing or failed.
    #[error("{tool} unavailable: {reason}")]
    CollaboratorUnavailable { tool: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn synthesis(requirement: impl Into<String>) -> Self {
        Error::Synthesis {
            requirement: requirement.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

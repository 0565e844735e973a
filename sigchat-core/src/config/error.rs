//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A `SIGCHAT_*` variable that does not parse
    #[error("Invalid {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

//! Errors raised by the shared configuration helpers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file unreadable or not serializable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file exists but is not valid TOML for the expected schema
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

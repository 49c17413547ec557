//! Crate-wide error taxonomy.
//!
//! One variant family per failure class from the load/format/config/IO
//! split: GGUF and tokenizer malformation surface as [`Error::Format`],
//! bad CLI/user-supplied knobs as [`Error::Config`], missing weights or
//! shape mismatches discovered while wiring up the model as
//! [`Error::Model`], and everything that touches the filesystem or mmap
//! as [`Error::Io`].

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("GGUF format error: {0}")]
    Format(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(String),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Error::Tokenizer(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Error::Model(msg.into())
    }
}

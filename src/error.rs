use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MareaError>;

#[derive(Debug, Error)]
pub enum MareaError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("not found")]
    NotFound,
}

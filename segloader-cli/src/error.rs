use segloader::{LoaderError, RequestError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Loader stopped unexpectedly")]
    LoaderStopped,
}

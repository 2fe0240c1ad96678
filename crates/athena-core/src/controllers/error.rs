use thiserror::Error;

use crate::repositories::ApiError;
use crate::services::{AccumulatorError, StreamError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Folder name is empty")]
    EmptyFolderName,

    #[error("A folder named '{0}' already exists")]
    DuplicateFolderName(String),

    #[error("A folder needs at least one conversation")]
    EmptyFolder,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Unknown folder: {0}")]
    UnknownFolder(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("No conversation selected")]
    NoSelection,

    #[error("A reply is already being generated for conversation {0}")]
    SendInFlight(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}

pub type ChatResult<T> = Result<T, ChatError>;

//! Article lifecycle: create, update, soft delete, read and list.
//!
//! Tag lists are applied through the same reconciliation used by
//! [`crate::tags::TagService`], inside the article's own transaction.

mod service;
mod slug;
mod view;

pub use service::{ArticleChanges, ArticleService, NewArticle};
pub use slug::slugify_title;
pub use view::{ArticleView, assemble};

use crate::context::Interrupted;
use crate::storage::StorageError;
use crate::tags::TagError;

#[derive(Debug, thiserror::Error)]
pub enum ArticleError {
    #[error("Article not found: {0}")]
    NotFound(String),

    #[error("Only the author may change this article")]
    Forbidden,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Article lookup failed")]
    LookupFailed(#[source] StorageError),

    #[error("Article write failed")]
    WriteFailed(#[source] StorageError),

    #[error("Tag update failed")]
    Tags(#[source] TagError),

    #[error("Transaction failed")]
    Transaction(#[source] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl ArticleError {
    fn from_write(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => ArticleError::Conflict(msg),
            other => ArticleError::WriteFailed(other),
        }
    }
}

impl From<TagError> for ArticleError {
    fn from(err: TagError) -> Self {
        match err {
            TagError::Interrupted(interrupted) => ArticleError::Interrupted(interrupted),
            other => ArticleError::Tags(other),
        }
    }
}

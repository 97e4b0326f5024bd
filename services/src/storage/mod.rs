//! Persistence gateway for the conduit store.
//!
//! Services depend on the [`ConduitStorage`] and [`StorageTransaction`] traits
//! only. [`PgConduitStorage`] backs them with PostgreSQL and
//! [`MockConduitStorage`] keeps everything in memory for tests.

mod mock;
mod postgres;
mod traits;
mod types;

pub use mock::{FailPoint, MockConduitStorage, MockTransaction, MockWrite};
pub use postgres::{PgConduitStorage, PgTransaction};
pub use traits::{ConduitStorage, StorageTransaction};
use crate::context::{CallContext, Interrupted};

pub use types::{
    ArticleFilter, ArticleInsert, ArticleRow, ArticleUpdate, CommentInsert, CommentRow,
    DEFAULT_ARTICLE_LIMIT, StorageError, TagRow, UserInsert, UserRow, UserUpdate,
};

/// Rolls back `tx`, logging instead of returning a rollback failure.
///
/// Used on error paths where the original error is what the caller needs.
pub(crate) async fn rollback_quietly<T: StorageTransaction>(tx: T, operation: &'static str) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(operation, error = %err, "Rollback failed");
    }
}

/// Commits `tx` unless `ctx` is already interrupted, in which case `tx` is
/// rolled back.
///
/// The commit is not raced against `ctx`. Once issued it runs to completion
/// and its outcome is reported, so `Interrupted` always means nothing was
/// committed.
pub(crate) async fn commit_unless_interrupted<T: StorageTransaction>(
    tx: T,
    ctx: &CallContext,
) -> Result<Result<(), StorageError>, Interrupted> {
    if let Err(interrupted) = ctx.check() {
        rollback_quietly(tx, "commit").await;
        return Err(interrupted);
    }
    Ok(tx.commit().await)
}

//! Idempotent favorite/unfavorite of an article by a user.
//!
//! The association row and the article's `favorites_count` change in the same
//! transaction. Repeating either operation is a successful no-op.

use crate::context::{CallContext, Interrupted};
use crate::storage::{
    ConduitStorage, StorageError, StorageTransaction, commit_unless_interrupted, rollback_quietly,
};

#[derive(Debug, thiserror::Error)]
pub enum FavoriteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Favorite lookup failed")]
    LookupFailed(#[source] StorageError),

    #[error("Favorite write failed")]
    WriteFailed(#[source] StorageError),

    #[error("Transaction failed")]
    Transaction(#[source] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Favorite status of an article for one user after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FavoriteState {
    pub favorited: bool,
    pub favorites_count: i64,
    /// Whether the call wrote anything.
    pub changed: bool,
}

#[derive(Clone)]
pub struct FavoriteService<S: ConduitStorage> {
    storage: S,
}

impl<S: ConduitStorage> FavoriteService<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip_all, fields(slug = %slug, username = %username))]
    pub async fn add_favorite(
        &self,
        slug: &str,
        username: &str,
        ctx: &CallContext,
    ) -> Result<FavoriteState, FavoriteError> {
        self.set_favorite(slug, username, true, ctx).await
    }

    #[tracing::instrument(skip_all, fields(slug = %slug, username = %username))]
    pub async fn remove_favorite(
        &self,
        slug: &str,
        username: &str,
        ctx: &CallContext,
    ) -> Result<FavoriteState, FavoriteError> {
        self.set_favorite(slug, username, false, ctx).await
    }

    async fn set_favorite(
        &self,
        slug: &str,
        username: &str,
        favorited: bool,
        ctx: &CallContext,
    ) -> Result<FavoriteState, FavoriteError> {
        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(FavoriteError::Transaction)?;

        let state = match set_in_tx(&mut tx, slug, username, favorited, ctx).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "Rolling back favorite change");
                rollback_quietly(tx, "set_favorite").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(FavoriteError::Transaction)?;

        if state.changed {
            tracing::debug!(
                favorited = state.favorited,
                favorites_count = state.favorites_count,
                "Favorite updated"
            );
        }
        Ok(state)
    }
}

async fn set_in_tx<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    username: &str,
    favorited: bool,
    ctx: &CallContext,
) -> Result<FavoriteState, FavoriteError> {
    let article = ctx
        .run(tx.find_article_by_slug(slug))
        .await?
        .map_err(FavoriteError::LookupFailed)?
        .ok_or_else(|| FavoriteError::NotFound(format!("article {slug}")))?;
    let user = ctx
        .run(tx.find_user_by_username(username))
        .await?
        .map_err(FavoriteError::LookupFailed)?
        .ok_or_else(|| FavoriteError::NotFound(format!("user {username}")))?;

    let exists = ctx
        .run(tx.find_favorite_association(article.id, user.id))
        .await?
        .map_err(FavoriteError::LookupFailed)?;

    if exists == favorited {
        return Ok(FavoriteState {
            favorited,
            favorites_count: article.favorites_count,
            changed: false,
        });
    }

    let written = if favorited {
        ctx.run(tx.create_favorite_association(article.id, user.id))
            .await?
    } else {
        ctx.run(tx.delete_favorite_association(article.id, user.id))
            .await?
    };
    let favorites_count = written.map_err(FavoriteError::WriteFailed)?;

    Ok(FavoriteState {
        favorited,
        favorites_count,
        changed: true,
    })
}

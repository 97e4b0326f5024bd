//! Comments on articles.

use crate::context::{CallContext, Interrupted};
use crate::profiles::ProfileView;
use crate::storage::{
    CommentInsert, CommentRow, ConduitStorage, StorageError, StorageTransaction, UserRow,
    commit_unless_interrupted, rollback_quietly,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Only the author may delete this comment")]
    Forbidden,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Comment lookup failed")]
    LookupFailed(#[source] StorageError),

    #[error("Comment write failed")]
    WriteFailed(#[source] StorageError),

    #[error("Transaction failed")]
    Transaction(#[source] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author: ProfileView,
}

impl CommentView {
    fn new(comment: &CommentRow, author: ProfileView) -> Self {
        Self {
            id: comment.id,
            body: comment.body.clone(),
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            author,
        }
    }
}

#[derive(Clone)]
pub struct CommentService<S: ConduitStorage> {
    storage: S,
}

impl<S: ConduitStorage> CommentService<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip_all, fields(slug = %slug, author = %author.username))]
    pub async fn add(
        &self,
        slug: &str,
        author: &UserRow,
        body: &str,
        ctx: &CallContext,
    ) -> Result<CommentView, CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::Validation("body must not be empty".to_owned()));
        }

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(CommentError::Transaction)?;

        let comment = match add_in_tx(&mut tx, slug, author.id, body, ctx).await {
            Ok(comment) => comment,
            Err(err) => {
                rollback_quietly(tx, "add_comment").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(CommentError::Transaction)?;

        tracing::debug!(comment_id = %comment.id, "Comment added");
        Ok(CommentView::new(
            &comment,
            ProfileView::from_user(author, false),
        ))
    }

    /// Comments of an article, oldest first.
    pub async fn list(
        &self,
        slug: &str,
        viewer: Option<Uuid>,
        ctx: &CallContext,
    ) -> Result<Vec<CommentView>, CommentError> {
        let article = ctx
            .run(self.storage.find_article_by_slug(slug))
            .await?
            .map_err(CommentError::LookupFailed)?
            .ok_or_else(|| CommentError::NotFound(format!("article {slug}")))?;

        let comments = ctx
            .run(self.storage.list_comments(article.id))
            .await?
            .map_err(CommentError::LookupFailed)?;

        let mut views = Vec::with_capacity(comments.len());
        for comment in &comments {
            let author = ctx
                .run(self.storage.find_user_by_id(comment.author_id))
                .await?
                .map_err(CommentError::LookupFailed)?
                .ok_or_else(|| CommentError::NotFound(format!("user {}", comment.author_id)))?;
            let following = match viewer {
                Some(viewer) => ctx
                    .run(self.storage.is_following(viewer, author.id))
                    .await?
                    .map_err(CommentError::LookupFailed)?,
                None => false,
            };
            views.push(CommentView::new(
                comment,
                ProfileView::from_user(&author, following),
            ));
        }
        Ok(views)
    }

    #[tracing::instrument(skip_all, fields(slug = %slug, comment_id = %comment_id))]
    pub async fn delete(
        &self,
        slug: &str,
        comment_id: Uuid,
        author: &UserRow,
        ctx: &CallContext,
    ) -> Result<(), CommentError> {
        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(CommentError::Transaction)?;

        if let Err(err) = delete_in_tx(&mut tx, slug, comment_id, author.id, ctx).await {
            rollback_quietly(tx, "delete_comment").await;
            return Err(err);
        }

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(CommentError::Transaction)?;

        tracing::debug!("Comment deleted");
        Ok(())
    }
}

async fn add_in_tx<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    author_id: Uuid,
    body: &str,
    ctx: &CallContext,
) -> Result<CommentRow, CommentError> {
    let article = ctx
        .run(tx.find_article_by_slug(slug))
        .await?
        .map_err(CommentError::LookupFailed)?
        .ok_or_else(|| CommentError::NotFound(format!("article {slug}")))?;

    ctx.run(tx.insert_comment(CommentInsert {
        article_id: article.id,
        author_id,
        body: body.to_owned(),
    }))
    .await?
    .map_err(CommentError::WriteFailed)
}

async fn delete_in_tx<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    comment_id: Uuid,
    author_id: Uuid,
    ctx: &CallContext,
) -> Result<(), CommentError> {
    let article = ctx
        .run(tx.find_article_by_slug(slug))
        .await?
        .map_err(CommentError::LookupFailed)?
        .ok_or_else(|| CommentError::NotFound(format!("article {slug}")))?;

    let comment = ctx
        .run(tx.find_comment(comment_id))
        .await?
        .map_err(CommentError::LookupFailed)?
        .filter(|c| c.article_id == article.id)
        .ok_or_else(|| CommentError::NotFound(format!("comment {comment_id}")))?;

    if comment.author_id != author_id {
        return Err(CommentError::Forbidden);
    }

    ctx.run(tx.delete_comment(comment.id))
        .await?
        .map_err(CommentError::WriteFailed)?;
    Ok(())
}

//! Tag catalog and article/tag reconciliation.
//!
//! The catalog is a shared set of unique tag names. Reconciliation moves an
//! article's associations to `requested ∩ catalog`: names that are not in the
//! catalog are skipped and reported, never created. The catalog only grows
//! through [`TagService::intern_tags`].

mod diff;

pub use diff::{TagPlan, normalize, plan};

use crate::context::{CallContext, Interrupted};
use crate::storage::{
    ArticleRow, ConduitStorage, StorageError, StorageTransaction, commit_unless_interrupted, rollback_quietly,
};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("Article not found: {0}")]
    NotFound(String),

    #[error("Article lookup failed")]
    ArticleLookupFailed(#[source] StorageError),

    #[error("Tag catalog lookup failed")]
    CatalogLookupFailed(#[source] StorageError),

    #[error("Tag catalog write failed")]
    CatalogWriteFailed(#[source] StorageError),

    #[error("Associated tag lookup failed")]
    LookupFailed(#[source] StorageError),

    #[error("Tag association write failed")]
    AssociationWriteFailed(#[source] StorageError),

    #[error("Transaction failed")]
    Transaction(#[source] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// What a reconciliation changed. All lists are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Requested names with no catalog entry.
    pub skipped: Vec<String>,
}

impl TagDiff {
    /// Whether the reconciliation wrote no association rows.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone)]
pub struct TagService<S: ConduitStorage> {
    storage: S,
}

impl<S: ConduitStorage> TagService<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Reconciles the tags of `article` in its own transaction.
    #[tracing::instrument(skip_all, fields(article_id = %article.id))]
    pub async fn reconcile_tags<I, N>(
        &self,
        article: &ArticleRow,
        requested: I,
        ctx: &CallContext,
    ) -> Result<TagDiff, TagError>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let requested = normalize(requested);

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(TagError::Transaction)?;

        let diff = match reconcile_in_tx(&mut tx, article.id, &requested, ctx).await {
            Ok(diff) => diff,
            Err(err) => {
                tracing::warn!(error = %err, "Rolling back tag reconciliation");
                rollback_quietly(tx, "reconcile_tags").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(TagError::Transaction)?;

        tracing::debug!(
            added = ?diff.added,
            removed = ?diff.removed,
            "Tags reconciled"
        );
        Ok(diff)
    }

    /// Looks the article up by slug, then reconciles its tags.
    pub async fn reconcile_tags_by_slug<I, N>(
        &self,
        slug: &str,
        requested: I,
        ctx: &CallContext,
    ) -> Result<TagDiff, TagError>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let article = ctx
            .run(self.storage.find_article_by_slug(slug))
            .await?
            .map_err(TagError::ArticleLookupFailed)?
            .ok_or_else(|| TagError::NotFound(slug.to_owned()))?;

        self.reconcile_tags(&article, requested, ctx).await
    }

    /// All catalog names, sorted.
    pub async fn list_tags(&self, ctx: &CallContext) -> Result<Vec<String>, TagError> {
        let tags = ctx
            .run(self.storage.list_all_tags())
            .await?
            .map_err(TagError::CatalogLookupFailed)?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    /// Adds catalog entries for names that do not exist yet. Existing names
    /// are left untouched.
    #[tracing::instrument(skip_all)]
    pub async fn intern_tags<I, N>(&self, names: I, ctx: &CallContext) -> Result<Vec<String>, TagError>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let names = normalize(names);
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(TagError::Transaction)?;

        let rows = match ctx.run(tx.insert_tags(&names)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                rollback_quietly(tx, "intern_tags").await;
                return Err(TagError::CatalogWriteFailed(err));
            }
            Err(interrupted) => {
                rollback_quietly(tx, "intern_tags").await;
                return Err(interrupted.into());
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(TagError::Transaction)?;

        tracing::debug!(count = rows.len(), "Tags interned");
        Ok(rows.into_iter().map(|t| t.name).collect())
    }
}

/// Reconciles inside a caller-owned transaction. Neither commits nor rolls
/// back.
///
/// The article is share-locked first, so it cannot be deleted before the
/// transaction ends, and a deleted article yields `NotFound`.
pub(crate) async fn reconcile_in_tx<T: StorageTransaction>(
    tx: &mut T,
    article_id: Uuid,
    requested: &BTreeSet<String>,
    ctx: &CallContext,
) -> Result<TagDiff, TagError> {
    ctx.run(tx.share_lock_article(article_id))
        .await?
        .map_err(TagError::ArticleLookupFailed)?
        .ok_or_else(|| TagError::NotFound(article_id.to_string()))?;

    let catalog = if requested.is_empty() {
        Vec::new()
    } else {
        ctx.run(tx.list_tag_catalog_by_names(requested))
            .await?
            .map_err(TagError::CatalogLookupFailed)?
    };

    let current = ctx
        .run(tx.list_associated_tags(article_id))
        .await?
        .map_err(TagError::LookupFailed)?;

    let plan = plan(requested, &catalog, &current);
    if !plan.skipped.is_empty() {
        tracing::debug!(skipped = ?plan.skipped, "Skipping tags missing from catalog");
    }

    if !plan.to_add.is_empty() {
        ctx.run(tx.add_tag_associations(article_id, &plan.to_add))
            .await?
            .map_err(TagError::AssociationWriteFailed)?;
    }
    if !plan.to_remove.is_empty() {
        ctx.run(tx.remove_tag_associations(article_id, &plan.to_remove))
            .await?
            .map_err(TagError::AssociationWriteFailed)?;
    }

    Ok(TagDiff {
        added: plan.to_add.into_iter().map(|t| t.name).collect(),
        removed: plan.to_remove.into_iter().map(|t| t.name).collect(),
        skipped: plan.skipped,
    })
}

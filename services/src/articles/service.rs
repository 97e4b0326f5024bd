use super::slug::unique_slug;
use super::view::{ArticleView, assemble};
use super::ArticleError;
use crate::context::CallContext;
use crate::profiles::ProfileView;
use crate::storage::{
    ArticleFilter, ArticleInsert, ArticleRow, ArticleUpdate, ConduitStorage, StorageTransaction,
    TagRow, UserRow, commit_unless_interrupted, rollback_quietly,
};
use crate::tags::{normalize, reconcile_in_tx};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
}

/// Partial article update. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ArticleChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub body: Option<String>,
    /// Replaces the whole tag list when set.
    pub tag_list: Option<Vec<String>>,
}

fn require_text(field: &str, value: &str) -> Result<(), ArticleError> {
    if value.trim().is_empty() {
        return Err(ArticleError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ArticleService<S: ConduitStorage> {
    storage: S,
}

impl<S: ConduitStorage> ArticleService<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip_all, fields(author = %author.username))]
    pub async fn create(
        &self,
        author: &UserRow,
        input: NewArticle,
        ctx: &CallContext,
    ) -> Result<ArticleView, ArticleError> {
        require_text("title", &input.title)?;
        require_text("description", &input.description)?;
        require_text("body", &input.body)?;

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ArticleError::Transaction)?;

        let (article, tags) = match create_in_tx(&mut tx, author.id, input, ctx).await {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(error = %err, "Rolling back article creation");
                rollback_quietly(tx, "create_article").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ArticleError::Transaction)?;

        tracing::debug!(slug = %article.slug, "Article created");
        Ok(assemble(
            &article,
            ProfileView::from_user(author, false),
            &tags,
            false,
        ))
    }

    #[tracing::instrument(skip_all, fields(slug = %slug, author = %author.username))]
    pub async fn update(
        &self,
        slug: &str,
        author: &UserRow,
        changes: ArticleChanges,
        ctx: &CallContext,
    ) -> Result<ArticleView, ArticleError> {
        for (field, value) in [
            ("title", &changes.title),
            ("description", &changes.description),
            ("body", &changes.body),
        ] {
            if let Some(value) = value {
                require_text(field, value)?;
            }
        }

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ArticleError::Transaction)?;

        let updated = match update_in_tx(&mut tx, slug, author.id, changes, ctx).await {
            Ok(updated) => updated,
            Err(err) => {
                tracing::warn!(error = %err, "Rolling back article update");
                rollback_quietly(tx, "update_article").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ArticleError::Transaction)?;

        let (article, tags, favorited) = updated;
        tracing::debug!(slug = %article.slug, "Article updated");
        Ok(assemble(
            &article,
            ProfileView::from_user(author, false),
            &tags,
            favorited,
        ))
    }

    /// Soft-deletes the article and drops its tag, favorite and comment rows.
    #[tracing::instrument(skip_all, fields(slug = %slug))]
    pub async fn delete(
        &self,
        slug: &str,
        author: &UserRow,
        ctx: &CallContext,
    ) -> Result<(), ArticleError> {
        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ArticleError::Transaction)?;

        if let Err(err) = delete_in_tx(&mut tx, slug, author.id, ctx).await {
            rollback_quietly(tx, "delete_article").await;
            return Err(err);
        }

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ArticleError::Transaction)?;

        tracing::debug!("Article deleted");
        Ok(())
    }

    pub async fn get(
        &self,
        slug: &str,
        viewer: Option<Uuid>,
        ctx: &CallContext,
    ) -> Result<ArticleView, ArticleError> {
        let article = ctx
            .run(self.storage.find_article_by_slug(slug))
            .await?
            .map_err(ArticleError::LookupFailed)?
            .ok_or_else(|| ArticleError::NotFound(slug.to_owned()))?;

        self.view_for(&article, viewer, ctx).await
    }

    /// Articles matching `filter`, newest first.
    pub async fn list(
        &self,
        filter: &ArticleFilter,
        viewer: Option<Uuid>,
        ctx: &CallContext,
    ) -> Result<Vec<ArticleView>, ArticleError> {
        let articles = ctx
            .run(self.storage.list_articles(filter))
            .await?
            .map_err(ArticleError::LookupFailed)?;

        let mut views = Vec::with_capacity(articles.len());
        for article in &articles {
            views.push(self.view_for(article, viewer, ctx).await?);
        }
        Ok(views)
    }

    /// The feed: articles by authors `user_id` follows.
    pub async fn feed(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        ctx: &CallContext,
    ) -> Result<Vec<ArticleView>, ArticleError> {
        let filter = ArticleFilter::feed(user_id).with_page(limit, offset);
        self.list(&filter, Some(user_id), ctx).await
    }

    async fn view_for(
        &self,
        article: &ArticleRow,
        viewer: Option<Uuid>,
        ctx: &CallContext,
    ) -> Result<ArticleView, ArticleError> {
        let author = ctx
            .run(self.storage.find_user_by_id(article.author_id))
            .await?
            .map_err(ArticleError::LookupFailed)?
            .ok_or_else(|| ArticleError::NotFound(format!("author of {}", article.slug)))?;
        let tags = ctx
            .run(self.storage.list_associated_tags(article.id))
            .await?
            .map_err(ArticleError::LookupFailed)?;

        let (favorited, following) = match viewer {
            Some(viewer) => {
                let favorited = ctx
                    .run(self.storage.find_favorite_association(article.id, viewer))
                    .await?
                    .map_err(ArticleError::LookupFailed)?;
                let following = ctx
                    .run(self.storage.is_following(viewer, author.id))
                    .await?
                    .map_err(ArticleError::LookupFailed)?;
                (favorited, following)
            }
            None => (false, false),
        };

        Ok(assemble(
            article,
            ProfileView::from_user(&author, following),
            &tags,
            favorited,
        ))
    }
}

async fn create_in_tx<T: StorageTransaction>(
    tx: &mut T,
    author_id: Uuid,
    input: NewArticle,
    ctx: &CallContext,
) -> Result<(ArticleRow, Vec<TagRow>), ArticleError> {
    let slug = unique_slug(tx, &input.title, None, ctx).await?;

    let article = ctx
        .run(tx.insert_article(ArticleInsert {
            author_id,
            slug,
            title: input.title,
            description: input.description,
            body: input.body,
        }))
        .await?
        .map_err(ArticleError::from_write)?;

    reconcile_in_tx(tx, article.id, &normalize(input.tag_list), ctx).await?;

    let tags = ctx
        .run(tx.list_associated_tags(article.id))
        .await?
        .map_err(ArticleError::LookupFailed)?;

    Ok((article, tags))
}

async fn find_owned<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    author_id: Uuid,
    ctx: &CallContext,
) -> Result<ArticleRow, ArticleError> {
    let article = ctx
        .run(tx.find_article_by_slug(slug))
        .await?
        .map_err(ArticleError::LookupFailed)?
        .ok_or_else(|| ArticleError::NotFound(slug.to_owned()))?;

    if article.author_id != author_id {
        return Err(ArticleError::Forbidden);
    }
    Ok(article)
}

async fn update_in_tx<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    author_id: Uuid,
    changes: ArticleChanges,
    ctx: &CallContext,
) -> Result<(ArticleRow, Vec<TagRow>, bool), ArticleError> {
    let article = find_owned(tx, slug, author_id, ctx).await?;

    let new_slug = match &changes.title {
        Some(title) if *title != article.title => {
            Some(unique_slug(tx, title, Some(&article.slug), ctx).await?)
        }
        _ => None,
    };

    let update = ArticleUpdate {
        slug: new_slug.filter(|s| *s != article.slug),
        title: changes.title,
        description: changes.description,
        body: changes.body,
    };
    let article = if update == ArticleUpdate::default() {
        article
    } else {
        ctx.run(tx.update_article(article.id, update))
            .await?
            .map_err(ArticleError::from_write)?
    };

    if let Some(tag_list) = changes.tag_list {
        reconcile_in_tx(tx, article.id, &normalize(tag_list), ctx).await?;
    }

    let tags = ctx
        .run(tx.list_associated_tags(article.id))
        .await?
        .map_err(ArticleError::LookupFailed)?;
    let favorited = ctx
        .run(tx.find_favorite_association(article.id, author_id))
        .await?
        .map_err(ArticleError::LookupFailed)?;

    Ok((article, tags, favorited))
}

async fn delete_in_tx<T: StorageTransaction>(
    tx: &mut T,
    slug: &str,
    author_id: Uuid,
    ctx: &CallContext,
) -> Result<(), ArticleError> {
    let article = find_owned(tx, slug, author_id, ctx).await?;

    ctx.run(tx.soft_delete_article(article.id))
        .await?
        .map_err(ArticleError::WriteFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Interrupted;
    use crate::storage::{FailPoint, MockConduitStorage};

    fn setup() -> (MockConduitStorage, UserRow, UserRow) {
        let alice = UserRow::new("alice", "alice@example.com", "hash");
        let bob = UserRow::new("bob", "bob@example.com", "hash");
        let storage = MockConduitStorage::new()
            .with_user(alice.clone())
            .with_user(bob.clone())
            .with_tags(["go", "rust"]);
        (storage, alice, bob)
    }

    fn new_article(title: &str, tags: &[&str]) -> NewArticle {
        NewArticle {
            title: title.to_owned(),
            description: "description".to_owned(),
            body: "body".to_owned(),
            tag_list: tags.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_filters_tags_through_catalog() {
        let (storage, alice, _) = setup();
        let service = ArticleService::new(storage.clone());

        let view = service
            .create(
                &alice,
                new_article("How to Train", &["rust", "dragons"]),
                &CallContext::background(),
            )
            .await
            .unwrap();

        assert_eq!(view.slug, "how-to-train");
        assert_eq!(view.tag_list, vec!["rust"]);
        assert_eq!(view.author.username, "alice");
        assert_eq!(storage.tag_count(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_title() {
        let (storage, alice, _) = setup();
        let service = ArticleService::new(storage);

        let err = service
            .create(&alice, new_article("  ", &[]), &CallContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, ArticleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_tags_fail() {
        let (storage, alice, _) = setup();
        storage.fail_on(FailPoint::AddTagAssociations);
        let service = ArticleService::new(storage.clone());

        let err = service
            .create(&alice, new_article("Tagged", &["go"]), &CallContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, ArticleError::Tags(_)));
        assert!(storage.find_article_by_slug("tagged").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_by_other_user_is_forbidden() {
        let (storage, alice, bob) = setup();
        let service = ArticleService::new(storage);
        let ctx = CallContext::background();
        service
            .create(&alice, new_article("Mine", &[]), &ctx)
            .await
            .unwrap();

        let err = service
            .update(
                "mine",
                &bob,
                ArticleChanges {
                    body: Some("hijacked".to_owned()),
                    ..ArticleChanges::default()
                },
                &ctx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ArticleError::Forbidden));
    }

    #[tokio::test]
    async fn test_update_title_rederives_slug() {
        let (storage, alice, _) = setup();
        let service = ArticleService::new(storage);
        let ctx = CallContext::background();
        service
            .create(&alice, new_article("First Title", &["go"]), &ctx)
            .await
            .unwrap();

        let view = service
            .update(
                "first-title",
                &alice,
                ArticleChanges {
                    title: Some("Second Title".to_owned()),
                    tag_list: Some(vec!["rust".to_owned()]),
                    ..ArticleChanges::default()
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(view.slug, "second-title");
        assert_eq!(view.tag_list, vec!["rust"]);
        assert!(matches!(
            service.get("first-title", None, &ctx).await,
            Err(ArticleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let (storage, alice, _) = setup();
        let service = ArticleService::new(storage);
        let ctx = CallContext::background();
        service
            .create(&alice, new_article("Short Lived", &["go"]), &ctx)
            .await
            .unwrap();

        service.delete("short-lived", &alice, &ctx).await.unwrap();

        assert!(matches!(
            service.get("short-lived", None, &ctx).await,
            Err(ArticleError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_stops_at_deadline() {
        let (storage, alice, _) = setup();
        let service = ArticleService::new(storage.clone());
        let ctx = CallContext::background();
        service
            .create(&alice, new_article("Slow Read", &[]), &ctx)
            .await
            .unwrap();
        let service = ArticleService::new(storage.with_latency(std::time::Duration::from_millis(40)));
        let ctx = CallContext::background().with_timeout(std::time::Duration::from_millis(60));

        let err = service
            .list(&ArticleFilter::default(), None, &ctx)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ArticleError::Interrupted(Interrupted::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_get_reports_viewer_state() {
        let (storage, alice, bob) = setup();
        let service = ArticleService::new(storage.clone());
        let ctx = CallContext::background();
        let created = service
            .create(&alice, new_article("Viewed", &[]), &ctx)
            .await
            .unwrap();
        let article = storage
            .find_article_by_slug(&created.slug)
            .await
            .unwrap()
            .unwrap();
        let storage = storage
            .with_favorite(article.id, bob.id)
            .with_follow(bob.id, alice.id);
        let service = ArticleService::new(storage);

        let view = service.get("viewed", Some(bob.id), &ctx).await.unwrap();

        assert!(view.favorited);
        assert_eq!(view.favorites_count, 1);
        assert!(view.author.following);
    }
}

//! In-memory mock implementation of `ConduitStorage` for testing.
//!
//! Transactions work on a private copy of the store and record every write.
//! On commit the recorded writes are replayed against the shared store in one
//! step, so a failed or dropped transaction leaves nothing behind. Concurrent
//! transactions behave like READ COMMITTED: each one sees the state as of its
//! `begin`, and the last commit wins per row. Article row locks are emulated
//! with one async read/write lock per article, held until the transaction
//! ends. Acquiring one refreshes the transaction's copy from the committed
//! store.

use super::traits::{ConduitStorage, StorageTransaction};
use super::types::{
    ArticleFilter, ArticleInsert, ArticleRow, ArticleUpdate, CommentInsert, CommentRow,
    StorageError, TagRow, UserInsert, UserRow, UserUpdate,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use uuid::Uuid;

/// Gateway operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    Commit,
    ArticleLookup,
    UserLookup,
    CatalogLookup,
    AssociatedTagsLookup,
    AddTagAssociations,
    RemoveTagAssociations,
    InsertTags,
    FavoriteLookup,
    CreateFavorite,
    DeleteFavorite,
    InsertArticle,
    UpdateArticle,
    DeleteArticle,
    InsertUser,
    UpdateUser,
    FollowLookup,
    CreateFollow,
    DeleteFollow,
    CommentLookup,
    InsertComment,
    DeleteComment,
}

/// A committed write, as recorded in the write log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    AddTag {
        article_id: Uuid,
        tag_id: Uuid,
    },
    RemoveTag {
        article_id: Uuid,
        tag_id: Uuid,
    },
    AddFavorite {
        article_id: Uuid,
        user_id: Uuid,
    },
    RemoveFavorite {
        article_id: Uuid,
        user_id: Uuid,
    },
    InsertArticle(ArticleRow),
    UpdateArticle {
        id: Uuid,
        changes: ArticleUpdate,
        at: DateTime<Utc>,
    },
    SoftDeleteArticle {
        id: Uuid,
        at: DateTime<Utc>,
    },
    InsertTag(TagRow),
    InsertUser(UserRow),
    UpdateUser {
        id: Uuid,
        changes: UserUpdate,
        at: DateTime<Utc>,
    },
    Follow {
        follower_id: Uuid,
        followee_id: Uuid,
    },
    Unfollow {
        follower_id: Uuid,
        followee_id: Uuid,
    },
    InsertComment(CommentRow),
    DeleteComment {
        id: Uuid,
    },
}

impl MockWrite {
    /// Whether this write touches the article/tag association table.
    pub fn is_tag_association(&self) -> bool {
        matches!(self, MockWrite::AddTag { .. } | MockWrite::RemoveTag { .. })
    }

    /// Whether this write touches the favorite association table.
    pub fn is_favorite_association(&self) -> bool {
        matches!(
            self,
            MockWrite::AddFavorite { .. } | MockWrite::RemoveFavorite { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
struct MockState {
    users: HashMap<Uuid, UserRow>,
    articles: HashMap<Uuid, ArticleRow>,
    tags: HashMap<Uuid, TagRow>,
    article_tags: BTreeSet<(Uuid, Uuid)>,
    favorites: BTreeSet<(Uuid, Uuid)>,
    follows: BTreeSet<(Uuid, Uuid)>,
    comments: HashMap<Uuid, CommentRow>,
}

impl MockState {
    fn live_article_by_slug(&self, slug: &str) -> Option<&ArticleRow> {
        self.articles
            .values()
            .find(|a| a.slug == slug && !a.is_deleted())
    }

    fn user_by_username(&self, username: &str) -> Option<&UserRow> {
        self.users.values().find(|u| u.username == username)
    }

    fn tags_by_names(&self, names: &BTreeSet<String>) -> Vec<TagRow> {
        let mut tags: Vec<TagRow> = self
            .tags
            .values()
            .filter(|t| names.contains(&t.name))
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    fn tags_for_article(&self, article_id: Uuid) -> Vec<TagRow> {
        let mut tags: Vec<TagRow> = self
            .article_tags
            .iter()
            .filter(|(a, _)| *a == article_id)
            .filter_map(|(_, t)| self.tags.get(t).cloned())
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    fn favorites_count(&self, article_id: Uuid) -> Result<i64, StorageError> {
        self.articles
            .get(&article_id)
            .map(|a| a.favorites_count)
            .ok_or_else(|| StorageError::NotFound(format!("article {article_id}")))
    }

    /// Applies one write, enforcing the same uniqueness rules as the schema.
    fn apply(&mut self, write: &MockWrite) -> Result<(), StorageError> {
        match write {
            MockWrite::AddTag { article_id, tag_id } => {
                self.article_tags.insert((*article_id, *tag_id));
            }
            MockWrite::RemoveTag { article_id, tag_id } => {
                self.article_tags.remove(&(*article_id, *tag_id));
            }
            MockWrite::AddFavorite {
                article_id,
                user_id,
            } => {
                if self.favorites.insert((*article_id, *user_id))
                    && let Some(article) = self.articles.get_mut(article_id)
                {
                    article.favorites_count += 1;
                }
            }
            MockWrite::RemoveFavorite {
                article_id,
                user_id,
            } => {
                if self.favorites.remove(&(*article_id, *user_id))
                    && let Some(article) = self.articles.get_mut(article_id)
                {
                    article.favorites_count -= 1;
                }
            }
            MockWrite::InsertArticle(row) => {
                if self.articles.values().any(|a| a.slug == row.slug) {
                    return Err(StorageError::Conflict(format!(
                        "slug already taken: {}",
                        row.slug
                    )));
                }
                self.articles.insert(row.id, row.clone());
            }
            MockWrite::UpdateArticle { id, changes, at } => {
                if let Some(slug) = &changes.slug
                    && self
                        .articles
                        .values()
                        .any(|a| a.id != *id && &a.slug == slug)
                {
                    return Err(StorageError::Conflict(format!(
                        "slug already taken: {slug}"
                    )));
                }
                let article = self
                    .articles
                    .get_mut(id)
                    .ok_or_else(|| StorageError::NotFound(format!("article {id}")))?;
                if let Some(slug) = &changes.slug {
                    article.slug.clone_from(slug);
                }
                if let Some(title) = &changes.title {
                    article.title.clone_from(title);
                }
                if let Some(description) = &changes.description {
                    article.description.clone_from(description);
                }
                if let Some(body) = &changes.body {
                    article.body.clone_from(body);
                }
                article.updated_at = *at;
            }
            MockWrite::SoftDeleteArticle { id, at } => {
                let article = self
                    .articles
                    .get_mut(id)
                    .ok_or_else(|| StorageError::NotFound(format!("article {id}")))?;
                article.deleted_at = Some(*at);
                article.favorites_count = 0;
                self.article_tags.retain(|(a, _)| a != id);
                self.favorites.retain(|(a, _)| a != id);
                self.comments.retain(|_, c| c.article_id != *id);
            }
            MockWrite::InsertTag(row) => {
                if !self.tags.values().any(|t| t.name == row.name) {
                    self.tags.insert(row.id, row.clone());
                }
            }
            MockWrite::InsertUser(row) => {
                if self
                    .users
                    .values()
                    .any(|u| u.username == row.username || u.email == row.email)
                {
                    return Err(StorageError::Conflict(format!(
                        "user already exists: {}",
                        row.username
                    )));
                }
                self.users.insert(row.id, row.clone());
            }
            MockWrite::UpdateUser { id, changes, at } => {
                if let Some(email) = &changes.email
                    && self
                        .users
                        .values()
                        .any(|u| u.id != *id && &u.email == email)
                {
                    return Err(StorageError::Conflict(format!(
                        "email already taken: {email}"
                    )));
                }
                let user = self
                    .users
                    .get_mut(id)
                    .ok_or_else(|| StorageError::NotFound(format!("user {id}")))?;
                if let Some(email) = &changes.email {
                    user.email.clone_from(email);
                }
                if let Some(hash) = &changes.password_hash {
                    user.password_hash.clone_from(hash);
                }
                if let Some(bio) = &changes.bio {
                    user.bio.clone_from(bio);
                }
                if let Some(image) = &changes.image {
                    user.image.clone_from(image);
                }
                user.updated_at = *at;
            }
            MockWrite::Follow {
                follower_id,
                followee_id,
            } => {
                self.follows.insert((*follower_id, *followee_id));
            }
            MockWrite::Unfollow {
                follower_id,
                followee_id,
            } => {
                self.follows.remove(&(*follower_id, *followee_id));
            }
            MockWrite::InsertComment(row) => {
                self.comments.insert(row.id, row.clone());
            }
            MockWrite::DeleteComment { id } => {
                self.comments.remove(id);
            }
        }
        Ok(())
    }
}

/// Shared behavior knobs, cloned into every transaction.
#[derive(Clone, Default)]
struct MockControls {
    failures: Arc<Mutex<HashSet<FailPoint>>>,
    write_log: Arc<Mutex<Vec<MockWrite>>>,
    row_locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::RwLock<()>>>>>,
    latency: Option<Duration>,
}

impl MockControls {
    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check(&self, point: FailPoint) -> Result<(), StorageError> {
        if self.failures.lock().expect("lock poisoned").contains(&point) {
            return Err(StorageError::Db(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn row_lock(&self, article_id: Uuid) -> Arc<tokio::sync::RwLock<()>> {
        let mut locks = self.row_locks.lock().expect("lock poisoned");
        Arc::clone(locks.entry(article_id).or_default())
    }
}

/// In-memory mock implementation of `ConduitStorage` for testing.
///
/// Clones share the same underlying store.
///
/// # Example
///
/// ```rust,ignore
/// use conduit_services::storage::{FailPoint, MockConduitStorage};
///
/// let storage = MockConduitStorage::new().with_tags(["go", "rust"]);
/// storage.fail_on(FailPoint::RemoveTagAssociations);
/// ```
#[derive(Clone)]
pub struct MockConduitStorage {
    state: Arc<RwLock<MockState>>,
    controls: MockControls,
    is_connected: bool,
}

impl Default for MockConduitStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConduitStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            controls: MockControls::default(),
            is_connected: true,
        }
    }

    /// A storage whose health check reports a lost connection.
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            ..Self::new()
        }
    }

    /// Every gateway call sleeps for `latency` before doing its work.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.controls.latency = Some(latency);
        self
    }

    pub fn with_user(self, user: UserRow) -> Self {
        self.write_state().users.insert(user.id, user);
        self
    }

    pub fn with_tags<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.write_state();
            for name in names {
                let row = TagRow::new(name);
                if !state.tags.values().any(|t| t.name == row.name) {
                    state.tags.insert(row.id, row);
                }
            }
        }
        self
    }

    pub fn with_article(self, article: ArticleRow) -> Self {
        self.write_state().articles.insert(article.id, article);
        self
    }

    /// Associates existing catalog tags with an article.
    ///
    /// # Panics
    ///
    /// Panics if a name is not in the catalog.
    pub fn with_article_tags(self, article_id: Uuid, names: &[&str]) -> Self {
        {
            let mut state = self.write_state();
            for name in names {
                let tag_id = state
                    .tags
                    .values()
                    .find(|t| t.name == *name)
                    .map(|t| t.id)
                    .expect("tag must be seeded before it is associated");
                state.article_tags.insert((article_id, tag_id));
            }
        }
        self
    }

    /// Seeds a favorite and bumps the article's counter.
    pub fn with_favorite(self, article_id: Uuid, user_id: Uuid) -> Self {
        {
            let mut state = self.write_state();
            if state.favorites.insert((article_id, user_id))
                && let Some(article) = state.articles.get_mut(&article_id)
            {
                article.favorites_count += 1;
            }
        }
        self
    }

    pub fn with_follow(self, follower_id: Uuid, followee_id: Uuid) -> Self {
        self.write_state()
            .follows
            .insert((follower_id, followee_id));
        self
    }

    /// Makes every subsequent call at `point` fail with a database error.
    pub fn fail_on(&self, point: FailPoint) {
        self.controls
            .failures
            .lock()
            .expect("lock poisoned")
            .insert(point);
    }

    pub fn clear_failures(&self) {
        self.controls
            .failures
            .lock()
            .expect("lock poisoned")
            .clear();
    }

    /// Writes applied by committed transactions, in commit order.
    pub fn write_log(&self) -> Vec<MockWrite> {
        self.controls.write_log.lock().expect("lock poisoned").clone()
    }

    pub fn clear_write_log(&self) {
        self.controls.write_log.lock().expect("lock poisoned").clear();
    }

    /// Names of the tags currently associated with an article.
    pub fn article_tag_names(&self, article_id: Uuid) -> BTreeSet<String> {
        self.read_state()
            .tags_for_article(article_id)
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    /// Number of association rows in the article/tag table for an article.
    pub fn article_tag_rows(&self, article_id: Uuid) -> usize {
        self.read_state()
            .article_tags
            .iter()
            .filter(|(a, _)| *a == article_id)
            .count()
    }

    /// Number of favorite rows for an article.
    pub fn favorite_rows(&self, article_id: Uuid) -> usize {
        self.read_state()
            .favorites
            .iter()
            .filter(|(a, _)| *a == article_id)
            .count()
    }

    /// Raw article row, soft-deleted ones included.
    pub fn article(&self, id: Uuid) -> Option<ArticleRow> {
        self.read_state().articles.get(&id).cloned()
    }

    pub fn tag_count(&self) -> usize {
        self.read_state().tags.len()
    }

    pub fn comment_count(&self) -> usize {
        self.read_state().comments.len()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MockState> {
        self.state.read().expect("lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MockState> {
        self.state.write().expect("lock poisoned")
    }
}

impl ConduitStorage for MockConduitStorage {
    type Tx = MockTransaction;

    async fn is_connected(&self) -> bool {
        self.is_connected
    }

    async fn begin(&self) -> Result<MockTransaction, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::Begin)?;
        let working = self.read_state().clone();
        Ok(MockTransaction {
            shared: Arc::clone(&self.state),
            controls: self.controls.clone(),
            working,
            pending: Vec::new(),
            locked: HashSet::new(),
            read_guards: Vec::new(),
            write_guards: Vec::new(),
        })
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::ArticleLookup)?;
        Ok(self.read_state().live_article_by_slug(slug).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::UserLookup)?;
        Ok(self.read_state().user_by_username(username).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::UserLookup)?;
        Ok(self.read_state().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::UserLookup)?;
        Ok(self
            .read_state()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list_tag_catalog_by_names(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<TagRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::CatalogLookup)?;
        Ok(self.read_state().tags_by_names(names))
    }

    async fn list_all_tags(&self) -> Result<Vec<TagRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::CatalogLookup)?;
        let mut tags: Vec<TagRow> = self.read_state().tags.values().cloned().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn list_associated_tags(&self, article_id: Uuid) -> Result<Vec<TagRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::AssociatedTagsLookup)?;
        Ok(self.read_state().tags_for_article(article_id))
    }

    async fn find_favorite_association(
        &self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::FavoriteLookup)?;
        Ok(self.read_state().favorites.contains(&(article_id, user_id)))
    }

    async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::FollowLookup)?;
        Ok(self
            .read_state()
            .follows
            .contains(&(follower_id, followee_id)))
    }

    async fn list_articles(&self, filter: &ArticleFilter) -> Result<Vec<ArticleRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::ArticleLookup)?;
        let state = self.read_state();

        let tag_id = match &filter.tag {
            Some(name) => match state.tags.values().find(|t| &t.name == name) {
                Some(tag) => Some(tag.id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let author_id = match &filter.author {
            Some(name) => match state.user_by_username(name) {
                Some(user) => Some(user.id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let favoriter_id = match &filter.favorited_by {
            Some(name) => match state.user_by_username(name) {
                Some(user) => Some(user.id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut rows: Vec<ArticleRow> = state
            .articles
            .values()
            .filter(|a| !a.is_deleted())
            .filter(|a| tag_id.is_none_or(|t| state.article_tags.contains(&(a.id, t))))
            .filter(|a| author_id.is_none_or(|id| a.author_id == id))
            .filter(|a| favoriter_id.is_none_or(|u| state.favorites.contains(&(a.id, u))))
            .filter(|a| {
                filter
                    .followed_by
                    .is_none_or(|f| state.follows.contains(&(f, a.author_id)))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = usize::try_from(filter.offset).unwrap_or(0);
        let limit = usize::try_from(filter.limit).unwrap_or(0);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_comments(&self, article_id: Uuid) -> Result<Vec<CommentRow>, StorageError> {
        self.controls.pause().await;
        self.controls.check(FailPoint::CommentLookup)?;
        let mut comments: Vec<CommentRow> = self
            .read_state()
            .comments
            .values()
            .filter(|c| c.article_id == article_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }
}

/// Transaction handed out by [`MockConduitStorage`].
pub struct MockTransaction {
    shared: Arc<RwLock<MockState>>,
    controls: MockControls,
    working: MockState,
    pending: Vec<MockWrite>,
    locked: HashSet<Uuid>,
    read_guards: Vec<OwnedRwLockReadGuard<()>>,
    write_guards: Vec<OwnedRwLockWriteGuard<()>>,
}

impl MockTransaction {
    async fn enter(&self, point: FailPoint) -> Result<(), StorageError> {
        self.controls.pause().await;
        self.controls.check(point)
    }

    fn stage(&mut self, write: MockWrite) -> Result<(), StorageError> {
        self.working.apply(&write)?;
        self.pending.push(write);
        Ok(())
    }

    /// Waits for the article's row lock unless this transaction holds it.
    async fn lock_row(&mut self, article_id: Uuid, exclusive: bool) {
        if self.locked.contains(&article_id) {
            return;
        }
        let lock = self.controls.row_lock(article_id);
        if exclusive {
            self.write_guards.push(lock.write_owned().await);
        } else {
            self.read_guards.push(lock.read_owned().await);
        }
        self.locked.insert(article_id);
    }

    /// Rebuilds the working copy from the committed store plus this
    /// transaction's own writes.
    fn refresh(&mut self) -> Result<(), StorageError> {
        let mut working = self.shared.read().expect("lock poisoned").clone();
        for write in &self.pending {
            working.apply(write)?;
        }
        self.working = working;
        Ok(())
    }
}

impl StorageTransaction for MockTransaction {
    async fn find_article_by_slug(&mut self, slug: &str) -> Result<Option<ArticleRow>, StorageError> {
        self.enter(FailPoint::ArticleLookup).await?;
        let committed = self
            .shared
            .read()
            .expect("lock poisoned")
            .live_article_by_slug(slug)
            .map(|a| a.id);
        let Some(id) = committed.or_else(|| self.working.live_article_by_slug(slug).map(|a| a.id))
        else {
            return Ok(None);
        };
        self.lock_row(id, true).await;
        self.refresh()?;
        Ok(self.working.live_article_by_slug(slug).cloned())
    }

    async fn share_lock_article(&mut self, id: Uuid) -> Result<Option<ArticleRow>, StorageError> {
        self.enter(FailPoint::ArticleLookup).await?;
        self.lock_row(id, false).await;
        self.refresh()?;
        Ok(self
            .working
            .articles
            .get(&id)
            .filter(|a| !a.is_deleted())
            .cloned())
    }

    async fn slug_exists(&mut self, slug: &str) -> Result<bool, StorageError> {
        self.enter(FailPoint::ArticleLookup).await?;
        Ok(self.working.articles.values().any(|a| a.slug == slug))
    }

    async fn insert_article(&mut self, input: ArticleInsert) -> Result<ArticleRow, StorageError> {
        self.enter(FailPoint::InsertArticle).await?;
        let now = Utc::now();
        let row = ArticleRow {
            id: Uuid::new_v4(),
            author_id: input.author_id,
            slug: input.slug,
            title: input.title,
            description: input.description,
            body: input.body,
            favorites_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.stage(MockWrite::InsertArticle(row.clone()))?;
        Ok(row)
    }

    async fn update_article(
        &mut self,
        id: Uuid,
        changes: ArticleUpdate,
    ) -> Result<ArticleRow, StorageError> {
        self.enter(FailPoint::UpdateArticle).await?;
        self.stage(MockWrite::UpdateArticle {
            id,
            changes,
            at: Utc::now(),
        })?;
        self.working
            .articles
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("article {id}")))
    }

    async fn soft_delete_article(&mut self, id: Uuid) -> Result<(), StorageError> {
        self.enter(FailPoint::DeleteArticle).await?;
        self.stage(MockWrite::SoftDeleteArticle { id, at: Utc::now() })
    }

    async fn list_tag_catalog_by_names(
        &mut self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<TagRow>, StorageError> {
        self.enter(FailPoint::CatalogLookup).await?;
        Ok(self.working.tags_by_names(names))
    }

    async fn insert_tags(&mut self, names: &BTreeSet<String>) -> Result<Vec<TagRow>, StorageError> {
        self.enter(FailPoint::InsertTags).await?;
        let known: HashSet<String> = self
            .working
            .tags_by_names(names)
            .into_iter()
            .map(|t| t.name)
            .collect();
        for name in names.iter().filter(|n| !known.contains(*n)) {
            self.stage(MockWrite::InsertTag(TagRow::new(name.clone())))?;
        }
        Ok(self.working.tags_by_names(names))
    }

    async fn list_associated_tags(&mut self, article_id: Uuid) -> Result<Vec<TagRow>, StorageError> {
        self.enter(FailPoint::AssociatedTagsLookup).await?;
        Ok(self.working.tags_for_article(article_id))
    }

    async fn add_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> Result<(), StorageError> {
        self.enter(FailPoint::AddTagAssociations).await?;
        for tag in tags {
            self.stage(MockWrite::AddTag {
                article_id,
                tag_id: tag.id,
            })?;
        }
        Ok(())
    }

    async fn remove_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> Result<(), StorageError> {
        self.enter(FailPoint::RemoveTagAssociations).await?;
        for tag in tags {
            self.stage(MockWrite::RemoveTag {
                article_id,
                tag_id: tag.id,
            })?;
        }
        Ok(())
    }

    async fn find_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StorageError> {
        self.enter(FailPoint::FavoriteLookup).await?;
        Ok(self.working.favorites.contains(&(article_id, user_id)))
    }

    async fn create_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StorageError> {
        self.enter(FailPoint::CreateFavorite).await?;
        self.working.favorites_count(article_id)?;
        self.stage(MockWrite::AddFavorite {
            article_id,
            user_id,
        })?;
        self.working.favorites_count(article_id)
    }

    async fn delete_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StorageError> {
        self.enter(FailPoint::DeleteFavorite).await?;
        self.working.favorites_count(article_id)?;
        self.stage(MockWrite::RemoveFavorite {
            article_id,
            user_id,
        })?;
        self.working.favorites_count(article_id)
    }

    async fn find_user_by_username(&mut self, username: &str) -> Result<Option<UserRow>, StorageError> {
        self.enter(FailPoint::UserLookup).await?;
        Ok(self.working.user_by_username(username).cloned())
    }

    async fn insert_user(&mut self, input: UserInsert) -> Result<UserRow, StorageError> {
        self.enter(FailPoint::InsertUser).await?;
        let row = UserRow::new(input.username, input.email, input.password_hash);
        self.stage(MockWrite::InsertUser(row.clone()))?;
        Ok(row)
    }

    async fn update_user(&mut self, id: Uuid, changes: UserUpdate) -> Result<UserRow, StorageError> {
        self.enter(FailPoint::UpdateUser).await?;
        self.stage(MockWrite::UpdateUser {
            id,
            changes,
            at: Utc::now(),
        })?;
        self.working
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }

    async fn is_following(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        self.enter(FailPoint::FollowLookup).await?;
        Ok(self.working.follows.contains(&(follower_id, followee_id)))
    }

    async fn create_follow(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        self.enter(FailPoint::CreateFollow).await?;
        if self.working.follows.contains(&(follower_id, followee_id)) {
            return Ok(false);
        }
        self.stage(MockWrite::Follow {
            follower_id,
            followee_id,
        })?;
        Ok(true)
    }

    async fn delete_follow(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        self.enter(FailPoint::DeleteFollow).await?;
        if !self.working.follows.contains(&(follower_id, followee_id)) {
            return Ok(false);
        }
        self.stage(MockWrite::Unfollow {
            follower_id,
            followee_id,
        })?;
        Ok(true)
    }

    async fn find_comment(&mut self, id: Uuid) -> Result<Option<CommentRow>, StorageError> {
        self.enter(FailPoint::CommentLookup).await?;
        Ok(self.working.comments.get(&id).cloned())
    }

    async fn insert_comment(&mut self, input: CommentInsert) -> Result<CommentRow, StorageError> {
        self.enter(FailPoint::InsertComment).await?;
        let now = Utc::now();
        let row = CommentRow {
            id: Uuid::new_v4(),
            article_id: input.article_id,
            author_id: input.author_id,
            body: input.body,
            created_at: now,
            updated_at: now,
        };
        self.stage(MockWrite::InsertComment(row.clone()))?;
        Ok(row)
    }

    async fn delete_comment(&mut self, id: Uuid) -> Result<bool, StorageError> {
        self.enter(FailPoint::DeleteComment).await?;
        if !self.working.comments.contains_key(&id) {
            return Ok(false);
        }
        self.stage(MockWrite::DeleteComment { id })?;
        Ok(true)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.enter(FailPoint::Commit).await?;
        let mut shared = self.shared.write().expect("lock poisoned");
        let mut next = shared.clone();
        for write in &self.pending {
            next.apply(write)?;
        }
        *shared = next;
        self.controls
            .write_log
            .lock()
            .expect("lock poisoned")
            .extend(self.pending.iter().cloned());
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MockConduitStorage, ArticleRow, UserRow) {
        let author = UserRow::new("alice", "alice@example.com", "hash");
        let article = ArticleRow::new_for_test(author.id, "hello", "Hello");
        let storage = MockConduitStorage::new()
            .with_user(author.clone())
            .with_article(article.clone())
            .with_tags(["go", "rust"]);
        (storage, article, author)
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let (storage, article, _) = seeded();
        let names: BTreeSet<String> = ["go".to_owned()].into();

        let mut tx = storage.begin().await.unwrap();
        let tags = tx.list_tag_catalog_by_names(&names).await.unwrap();
        tx.add_tag_associations(article.id, &tags).await.unwrap();

        assert_eq!(tx.list_associated_tags(article.id).await.unwrap().len(), 1);
        assert!(storage.article_tag_names(article.id).is_empty());

        drop(tx);
        assert!(storage.article_tag_names(article.id).is_empty());
        assert!(storage.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_and_logs_writes() {
        let (storage, article, _) = seeded();
        let names: BTreeSet<String> = ["go".to_owned(), "rust".to_owned()].into();

        let mut tx = storage.begin().await.unwrap();
        let tags = tx.list_tag_catalog_by_names(&names).await.unwrap();
        tx.add_tag_associations(article.id, &tags).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(storage.article_tag_names(article.id), names);
        assert_eq!(storage.write_log().len(), 2);
        assert!(storage.write_log().iter().all(MockWrite::is_tag_association));
    }

    #[tokio::test]
    async fn test_fail_point_returns_db_error() {
        let (storage, _, _) = seeded();
        storage.fail_on(FailPoint::Begin);

        assert!(matches!(storage.begin().await, Err(StorageError::Db(_))));

        storage.clear_failures();
        assert!(storage.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_favorite_counter_follows_rows() {
        let (storage, article, author) = seeded();

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(
            tx.create_favorite_association(article.id, author.id)
                .await
                .unwrap(),
            1
        );
        tx.commit().await.unwrap();
        assert_eq!(storage.article(article.id).unwrap().favorites_count, 1);

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(
            tx.delete_favorite_association(article.id, author.id)
                .await
                .unwrap(),
            0
        );
        tx.commit().await.unwrap();
        assert_eq!(storage.article(article.id).unwrap().favorites_count, 0);
        assert_eq!(storage.favorite_rows(article.id), 0);
    }

    #[tokio::test]
    async fn test_insert_tags_interns_names() {
        let (storage, _, _) = seeded();
        let names: BTreeSet<String> = ["go".to_owned(), "zig".to_owned()].into();

        let mut tx = storage.begin().await.unwrap();
        let rows = tx.insert_tags(&names).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(storage.tag_count(), 3);
    }

    #[tokio::test]
    async fn test_conflicting_slug_is_rejected() {
        let (storage, article, author) = seeded();

        let mut tx = storage.begin().await.unwrap();
        let result = tx
            .insert_article(ArticleInsert {
                author_id: author.id,
                slug: article.slug.clone(),
                title: "Other".to_owned(),
                description: "d".to_owned(),
                body: "b".to_owned(),
            })
            .await;

        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_share_locks_coexist_and_skip_deleted_rows() {
        let (storage, article, _) = seeded();

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        assert!(first.share_lock_article(article.id).await.unwrap().is_some());
        assert!(second.share_lock_article(article.id).await.unwrap().is_some());
        first.commit().await.unwrap();
        second.rollback().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.soft_delete_article(article.id).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.share_lock_article(article.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_article_and_drops_associations() {
        let (storage, article, author) = seeded();
        let storage = storage
            .with_article_tags(article.id, &["go"])
            .with_favorite(article.id, author.id);

        let mut tx = storage.begin().await.unwrap();
        tx.soft_delete_article(article.id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(
            storage
                .find_article_by_slug(&article.slug)
                .await
                .unwrap()
                .is_none()
        );
        assert!(storage.article(article.id).unwrap().is_deleted());
        assert_eq!(storage.article_tag_rows(article.id), 0);
        assert_eq!(storage.favorite_rows(article.id), 0);
    }

    #[tokio::test]
    async fn test_list_articles_filters_by_tag_and_author() {
        let (storage, article, author) = seeded();
        let other = ArticleRow::new_for_test(author.id, "other", "Other");
        let storage = storage
            .with_article(other.clone())
            .with_article_tags(article.id, &["rust"]);

        let by_tag = storage
            .list_articles(&ArticleFilter::default().with_tag("rust"))
            .await
            .unwrap();
        assert_eq!(by_tag, vec![article.clone()]);

        let by_author = storage
            .list_articles(&ArticleFilter::default().with_author("alice"))
            .await
            .unwrap();
        assert_eq!(by_author.len(), 2);

        let unknown = storage
            .list_articles(&ArticleFilter::default().with_author("nobody"))
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }
}

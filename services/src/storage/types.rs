//! Row and input types shared by every `ConduitStorage` implementation.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A persisted article.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArticleRow {
    pub id: Uuid,
    pub author_id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    /// Denormalized count of favorite associations.
    pub favorites_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Lookups by slug skip rows where this is set.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ArticleRow {
    /// Builds an unsaved article row with the given slug and title.
    ///
    /// This is intended for seeding test storages. Production code creates
    /// articles through [`StorageTransaction::insert_article`].
    ///
    /// [`StorageTransaction::insert_article`]: super::StorageTransaction::insert_article
    pub fn new_for_test(author_id: Uuid, slug: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            author_id,
            slug: slug.into(),
            title: title.into(),
            description: "description".to_owned(),
            body: "body".to_owned(),
            favorites_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An entry of the global tag catalog.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TagRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl TagRow {
    /// Creates a catalog entry with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A persisted user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Opaque hash produced by the auth layer.
    pub password_hash: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    /// Creates a user row with a generated UUID and no profile fields.
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            bio: None,
            image: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted comment.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CommentRow {
    pub id: Uuid,
    pub article_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting a new article.
#[derive(Debug, Clone)]
pub struct ArticleInsert {
    pub author_id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
}

/// Partial update of an article. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleUpdate {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub body: Option<String>,
}

/// Input for inserting a new user.
#[derive(Debug, Clone)]
pub struct UserInsert {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Partial update of a user.
///
/// For `bio` and `image`, `None` keeps the existing value, `Some(None)` clears
/// it and `Some(Some(v))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub bio: Option<Option<String>>,
    pub image: Option<Option<String>>,
}

/// Input for inserting a comment.
#[derive(Debug, Clone)]
pub struct CommentInsert {
    pub article_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
}

/// Default page size for article listings.
pub const DEFAULT_ARTICLE_LIMIT: i64 = 20;

/// Filters for listing articles. Rows are returned newest first.
#[derive(Debug, Clone)]
pub struct ArticleFilter {
    /// Only articles associated with this tag name.
    pub tag: Option<String>,
    /// Only articles written by this username.
    pub author: Option<String>,
    /// Only articles favorited by this username.
    pub favorited_by: Option<String>,
    /// Only articles whose author is followed by this user (the feed).
    pub followed_by: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ArticleFilter {
    fn default() -> Self {
        Self {
            tag: None,
            author: None,
            favorited_by: None,
            followed_by: None,
            limit: DEFAULT_ARTICLE_LIMIT,
            offset: 0,
        }
    }
}

impl ArticleFilter {
    /// Feed of articles by authors `user_id` follows.
    pub fn feed(user_id: Uuid) -> Self {
        Self {
            followed_by: Some(user_id),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_favorited_by(mut self, username: impl Into<String>) -> Self {
        self.favorited_by = Some(username.into());
        self
    }

    pub fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Error type for persistence gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The addressed row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Db(String),
}

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                StorageError::Conflict(db.message().to_owned())
            }
            _ => StorageError::Db(err.to_string()),
        }
    }
}

//! Persistence gateway traits.

use super::types::{
    ArticleFilter, ArticleInsert, ArticleRow, ArticleUpdate, CommentInsert, CommentRow,
    StorageError, TagRow, UserInsert, UserRow, UserUpdate,
};
use std::collections::BTreeSet;
use std::future::Future;
use uuid::Uuid;

/// Read access to the conduit store plus the entry point for transactions.
///
/// Reads here run outside any transaction and see committed data only. Every
/// write goes through [`StorageTransaction`], obtained from [`begin`].
///
/// [`begin`]: ConduitStorage::begin
pub trait ConduitStorage: Clone + Send + Sync + 'static {
    /// The transactional scope handed out by [`ConduitStorage::begin`].
    type Tx: StorageTransaction;

    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    /// Opens a transaction. Dropping it without [`StorageTransaction::commit`]
    /// discards its writes.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StorageError>> + Send;

    /// Looks up a live (not soft-deleted) article by slug.
    fn find_article_by_slug(
        &self,
        slug: &str,
    ) -> impl Future<Output = Result<Option<ArticleRow>, StorageError>> + Send;

    fn find_user_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<UserRow>, StorageError>> + Send;

    fn find_user_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<UserRow>, StorageError>> + Send;

    fn find_user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<UserRow>, StorageError>> + Send;

    /// Returns the catalog entries whose name is in `names`. Unknown names are
    /// simply absent from the result.
    fn list_tag_catalog_by_names(
        &self,
        names: &BTreeSet<String>,
    ) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    fn list_all_tags(&self) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    fn list_associated_tags(
        &self,
        article_id: Uuid,
    ) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    fn find_favorite_association(
        &self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn is_following(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn list_articles(
        &self,
        filter: &ArticleFilter,
    ) -> impl Future<Output = Result<Vec<ArticleRow>, StorageError>> + Send;

    /// Comments of an article, oldest first.
    fn list_comments(
        &self,
        article_id: Uuid,
    ) -> impl Future<Output = Result<Vec<CommentRow>, StorageError>> + Send;
}

/// A transactional scope over the conduit store.
///
/// All writes issued through one value become visible together on
/// [`commit`](StorageTransaction::commit), or not at all.
pub trait StorageTransaction: Send + 'static {
    /// Looks up a live article by slug and locks it for update until the
    /// transaction ends.
    fn find_article_by_slug(
        &mut self,
        slug: &str,
    ) -> impl Future<Output = Result<Option<ArticleRow>, StorageError>> + Send;

    /// Takes a share lock on a live article until the transaction ends.
    ///
    /// Share locks do not block each other, but they do block a concurrent
    /// [`find_article_by_slug`] lock, so the article cannot be deleted
    /// underneath the caller. Returns `None` if the article is missing or
    /// soft-deleted once the lock is granted.
    ///
    /// [`find_article_by_slug`]: StorageTransaction::find_article_by_slug
    fn share_lock_article(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ArticleRow>, StorageError>> + Send;

    /// Whether any article, soft-deleted ones included, already uses `slug`.
    fn slug_exists(&mut self, slug: &str)
    -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn insert_article(
        &mut self,
        input: ArticleInsert,
    ) -> impl Future<Output = Result<ArticleRow, StorageError>> + Send;

    fn update_article(
        &mut self,
        id: Uuid,
        changes: ArticleUpdate,
    ) -> impl Future<Output = Result<ArticleRow, StorageError>> + Send;

    /// Marks the article deleted and drops its tag, favorite and comment rows.
    fn soft_delete_article(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn list_tag_catalog_by_names(
        &mut self,
        names: &BTreeSet<String>,
    ) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    /// Inserts catalog entries for names not yet present. Returns the full
    /// catalog rows for every requested name.
    fn insert_tags(
        &mut self,
        names: &BTreeSet<String>,
    ) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    fn list_associated_tags(
        &mut self,
        article_id: Uuid,
    ) -> impl Future<Output = Result<Vec<TagRow>, StorageError>> + Send;

    /// Associates every tag with the article. Existing pairs are left alone.
    fn add_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn remove_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn find_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Creates the association and bumps `favorites_count`. Returns the new
    /// count.
    fn create_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Deletes the association and lowers `favorites_count`. Returns the new
    /// count.
    fn delete_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send;

    fn find_user_by_username(
        &mut self,
        username: &str,
    ) -> impl Future<Output = Result<Option<UserRow>, StorageError>> + Send;

    fn insert_user(
        &mut self,
        input: UserInsert,
    ) -> impl Future<Output = Result<UserRow, StorageError>> + Send;

    fn update_user(
        &mut self,
        id: Uuid,
        changes: UserUpdate,
    ) -> impl Future<Output = Result<UserRow, StorageError>> + Send;

    fn is_following(
        &mut self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Returns `true` if a new row was written.
    fn create_follow(
        &mut self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Returns `true` if a row was removed.
    fn delete_follow(
        &mut self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn find_comment(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<CommentRow>, StorageError>> + Send;

    fn insert_comment(
        &mut self,
        input: CommentInsert,
    ) -> impl Future<Output = Result<CommentRow, StorageError>> + Send;

    /// Returns `true` if a row was removed.
    fn delete_comment(&mut self, id: Uuid)
    -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

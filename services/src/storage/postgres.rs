//! PostgreSQL implementation of the persistence gateway.

use super::traits::{ConduitStorage, StorageTransaction};
use super::types::{
    ArticleFilter, ArticleInsert, ArticleRow, ArticleUpdate, CommentInsert, CommentRow,
    StorageError, TagRow, UserInsert, UserRow, UserUpdate,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use uuid::Uuid;

const ARTICLE_COLUMNS: &str = "a.id, a.author_id, a.slug, a.title, a.description, a.body, \
     a.favorites_count, a.created_at, a.updated_at, a.deleted_at";

#[derive(Clone)]
pub struct PgConduitStorage {
    pub pool: PgPool,
}

impl PgConduitStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn names_vec(names: &BTreeSet<String>) -> Vec<String> {
    names.iter().cloned().collect()
}

fn tag_ids(tags: &[TagRow]) -> Vec<Uuid> {
    tags.iter().map(|t| t.id).collect()
}

impl ConduitStorage for PgConduitStorage {
    type Tx = PgTransaction;

    async fn is_connected(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn begin(&self) -> Result<PgTransaction, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction { tx })
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRow>, StorageError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT * FROM articles
            WHERE slug = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_tag_catalog_by_names(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<TagRow>, StorageError> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE name = ANY($1) ORDER BY name",
        )
        .bind(names_vec(names))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_all_tags(&self) -> Result<Vec<TagRow>, StorageError> {
        let rows = sqlx::query_as::<_, TagRow>("SELECT * FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_associated_tags(&self, article_id: Uuid) -> Result<Vec<TagRow>, StorageError> {
        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT t.* FROM tags t
            JOIN article_tags atg ON atg.tag_id = t.id
            WHERE atg.article_id = $1
            ORDER BY t.name
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_favorite_association(
        &self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StorageError> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM favorites WHERE article_id = $1 AND user_id = $2)",
        )
        .bind(article_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn list_articles(&self, filter: &ArticleFilter) -> Result<Vec<ArticleRow>, StorageError> {
        // NULL parameters disable their filter.
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS} FROM articles a
            JOIN users author ON author.id = a.author_id
            WHERE a.deleted_at IS NULL
              AND ($1::text IS NULL OR EXISTS (
                    SELECT 1 FROM article_tags atg JOIN tags t ON t.id = atg.tag_id
                    WHERE atg.article_id = a.id AND t.name = $1))
              AND ($2::text IS NULL OR author.username = $2)
              AND ($3::text IS NULL OR EXISTS (
                    SELECT 1 FROM favorites f JOIN users fu ON fu.id = f.user_id
                    WHERE f.article_id = a.id AND fu.username = $3))
              AND ($4::uuid IS NULL OR EXISTS (
                    SELECT 1 FROM follows fo
                    WHERE fo.follower_id = $4 AND fo.followee_id = a.author_id))
            ORDER BY a.created_at DESC
            LIMIT $5 OFFSET $6
            "#
        );
        let rows = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(filter.tag.as_deref())
            .bind(filter.author.as_deref())
            .bind(filter.favorited_by.as_deref())
            .bind(filter.followed_by)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_comments(&self, article_id: Uuid) -> Result<Vec<CommentRow>, StorageError> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT * FROM comments WHERE article_id = $1 ORDER BY created_at",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// An open database transaction. Dropping it rolls back.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl StorageTransaction for PgTransaction {
    async fn find_article_by_slug(&mut self, slug: &str) -> Result<Option<ArticleRow>, StorageError> {
        // Row lock so concurrent writers of the same article serialize here.
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT * FROM articles
            WHERE slug = $1 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(slug)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn share_lock_article(&mut self, id: Uuid) -> Result<Option<ArticleRow>, StorageError> {
        // Under READ COMMITTED the WHERE clause is rechecked once a blocking
        // delete commits, so a row deleted meanwhile comes back empty.
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT * FROM articles
            WHERE id = $1 AND deleted_at IS NULL
            FOR SHARE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn slug_exists(&mut self, slug: &str) -> Result<bool, StorageError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM articles WHERE slug = $1)")
                .bind(slug)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(found)
    }

    async fn insert_article(&mut self, input: ArticleInsert) -> Result<ArticleRow, StorageError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            INSERT INTO articles (author_id, slug, title, description, body)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(input.author_id)
        .bind(input.slug)
        .bind(input.title)
        .bind(input.description)
        .bind(input.body)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn update_article(
        &mut self,
        id: Uuid,
        changes: ArticleUpdate,
    ) -> Result<ArticleRow, StorageError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            UPDATE articles SET
                slug = COALESCE($2, slug),
                title = COALESCE($3, title),
                description = COALESCE($4, description),
                body = COALESCE($5, body),
                updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.slug)
        .bind(changes.title)
        .bind(changes.description)
        .bind(changes.body)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn soft_delete_article(&mut self, id: Uuid) -> Result<(), StorageError> {
        for sql in [
            "DELETE FROM article_tags WHERE article_id = $1",
            "DELETE FROM favorites WHERE article_id = $1",
            "DELETE FROM comments WHERE article_id = $1",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *self.tx).await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE articles
            SET deleted_at = now(), favorites_count = 0
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("article {id}")));
        }
        Ok(())
    }

    async fn list_tag_catalog_by_names(
        &mut self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<TagRow>, StorageError> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE name = ANY($1) ORDER BY name",
        )
        .bind(names_vec(names))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn insert_tags(&mut self, names: &BTreeSet<String>) -> Result<Vec<TagRow>, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO tags (name)
            SELECT * FROM UNNEST($1::text[])
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(names_vec(names))
        .execute(&mut *self.tx)
        .await?;

        self.list_tag_catalog_by_names(names).await
    }

    async fn list_associated_tags(&mut self, article_id: Uuid) -> Result<Vec<TagRow>, StorageError> {
        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT t.* FROM tags t
            JOIN article_tags atg ON atg.tag_id = t.id
            WHERE atg.article_id = $1
            ORDER BY t.name
            "#,
        )
        .bind(article_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn add_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> Result<(), StorageError> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO article_tags (article_id, tag_id)
            SELECT $1::uuid, tag_id FROM UNNEST($2::uuid[]) AS tag_id
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article_id)
        .bind(tag_ids(tags))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_tag_associations(
        &mut self,
        article_id: Uuid,
        tags: &[TagRow],
    ) -> Result<(), StorageError> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM article_tags WHERE article_id = $1 AND tag_id = ANY($2)")
            .bind(article_id)
            .bind(tag_ids(tags))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StorageError> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM favorites WHERE article_id = $1 AND user_id = $2)",
        )
        .bind(article_id)
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(found)
    }

    async fn create_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StorageError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO favorites (article_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article_id)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        let count: i64 = sqlx::query_scalar(
            r#"
            UPDATE articles SET favorites_count = favorites_count + $2
            WHERE id = $1
            RETURNING favorites_count
            "#,
        )
        .bind(article_id)
        .bind(i64::try_from(inserted).unwrap_or(0))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn delete_favorite_association(
        &mut self,
        article_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StorageError> {
        let deleted = sqlx::query("DELETE FROM favorites WHERE article_id = $1 AND user_id = $2")
            .bind(article_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        let count: i64 = sqlx::query_scalar(
            r#"
            UPDATE articles SET favorites_count = favorites_count - $2
            WHERE id = $1
            RETURNING favorites_count
            "#,
        )
        .bind(article_id)
        .bind(i64::try_from(deleted).unwrap_or(0))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn find_user_by_username(&mut self, username: &str) -> Result<Option<UserRow>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn insert_user(&mut self, input: UserInsert) -> Result<UserRow, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(input.username)
        .bind(input.email)
        .bind(input.password_hash)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn update_user(&mut self, id: Uuid, changes: UserUpdate) -> Result<UserRow, StorageError> {
        // $4/$6 carry whether the nullable column is being set at all.
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users SET
                email = COALESCE($2, email),
                password_hash = COALESCE($3, password_hash),
                bio = CASE WHEN $4 THEN $5 ELSE bio END,
                image = CASE WHEN $6 THEN $7 ELSE image END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.email)
        .bind(changes.password_hash)
        .bind(changes.bio.is_some())
        .bind(changes.bio.flatten())
        .bind(changes.image.is_some())
        .bind(changes.image.flatten())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn is_following(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(found)
    }

    async fn create_follow(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO follows (follower_id, followee_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_follow(&mut self, follower_id: Uuid, followee_id: Uuid) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2")
                .bind(follower_id)
                .bind(followee_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_comment(&mut self, id: Uuid) -> Result<Option<CommentRow>, StorageError> {
        let row = sqlx::query_as::<_, CommentRow>("SELECT * FROM comments WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn insert_comment(&mut self, input: CommentInsert) -> Result<CommentRow, StorageError> {
        let row = sqlx::query_as::<_, CommentRow>(
            r#"
            INSERT INTO comments (article_id, author_id, body)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(input.article_id)
        .bind(input.author_id)
        .bind(input.body)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn delete_comment(&mut self, id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

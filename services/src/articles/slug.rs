use super::ArticleError;
use crate::context::CallContext;
use crate::storage::StorageTransaction;

const FALLBACK_SLUG: &str = "article";

/// URL-safe slug for a title: lowercase, non-alphanumerics become `-`,
/// repeated and trailing separators collapse.
pub fn slugify_title(title: &str) -> String {
    let slug = ::slug::slugify(title);
    if slug.is_empty() {
        FALLBACK_SLUG.to_owned()
    } else {
        slug
    }
}

/// First of `base`, `base-1`, `base-2`, ... not used by any article,
/// soft-deleted ones included. `owned` is a slug the caller already holds and
/// may keep.
pub(crate) async fn unique_slug<T: StorageTransaction>(
    tx: &mut T,
    title: &str,
    owned: Option<&str>,
    ctx: &CallContext,
) -> Result<String, ArticleError> {
    let base = slugify_title(title);
    let mut candidate = base.clone();
    let mut counter = 0u32;

    loop {
        if owned == Some(candidate.as_str()) {
            return Ok(candidate);
        }
        let taken = ctx
            .run(tx.slug_exists(&candidate))
            .await?
            .map_err(ArticleError::LookupFailed)?;
        if !taken {
            return Ok(candidate);
        }
        counter += 1;
        candidate = format!("{base}-{counter}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ArticleRow, ConduitStorage, MockConduitStorage};
    use uuid::Uuid;

    #[test]
    fn test_slugify_title() {
        assert_eq!(slugify_title("Hello, World!"), "hello-world");
        assert_eq!(slugify_title("  Rust   &  Go  "), "rust-go");
        assert_eq!(slugify_title("???"), "article");
    }

    #[tokio::test]
    async fn test_unique_slug_appends_counter() {
        let author = Uuid::new_v4();
        let mut deleted = ArticleRow::new_for_test(author, "hello-world-1", "Hello World");
        deleted.deleted_at = Some(chrono::Utc::now());
        let storage = MockConduitStorage::new()
            .with_article(ArticleRow::new_for_test(author, "hello-world", "Hello World"))
            .with_article(deleted);
        let ctx = CallContext::background();

        let mut tx = storage.begin().await.unwrap();
        let slug = unique_slug(&mut tx, "Hello World", None, &ctx).await.unwrap();

        assert_eq!(slug, "hello-world-2");
    }

    #[tokio::test]
    async fn test_unique_slug_keeps_owned_slug() {
        let author = Uuid::new_v4();
        let storage = MockConduitStorage::new()
            .with_article(ArticleRow::new_for_test(author, "hello-world", "Hello World"));
        let ctx = CallContext::background();

        let mut tx = storage.begin().await.unwrap();
        let slug = unique_slug(&mut tx, "Hello World", Some("hello-world"), &ctx)
            .await
            .unwrap();

        assert_eq!(slug, "hello-world");
    }
}

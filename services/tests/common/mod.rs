//! Shared test utilities for integration tests.
//!
//! This module provides a seeded `MockConduitStorage` and a few helpers for
//! reading back association state.

use conduit_services::storage::{ArticleRow, MockConduitStorage, UserRow};
use std::collections::BTreeSet;

/// Slug of the article every fixture seeds.
#[allow(dead_code)]
pub const ARTICLE_SLUG: &str = "how-to-train-your-dragon";

/// Tags present in the catalog of every fixture. "python" is deliberately
/// missing.
pub const CATALOG: [&str; 5] = ["go", "rust", "web", "a", "b"];

#[allow(dead_code)]
pub struct Fixture {
    pub storage: MockConduitStorage,
    pub author: UserRow,
    pub reader: UserRow,
    pub article: ArticleRow,
}

#[allow(dead_code)]
impl Fixture {
    /// Seeds two users, the catalog and one article tagged with `tags`.
    pub fn new(tags: &[&str]) -> Self {
        Self::from_storage(MockConduitStorage::new(), tags)
    }

    pub fn from_storage(storage: MockConduitStorage, tags: &[&str]) -> Self {
        let author = UserRow::new("jake", "jake@jake.jake", "hash");
        let reader = UserRow::new("jane", "jane@jane.jane", "hash");
        let article = ArticleRow::new_for_test(author.id, ARTICLE_SLUG, "How to train your dragon");
        let storage = storage
            .with_user(author.clone())
            .with_user(reader.clone())
            .with_tags(CATALOG)
            .with_article(article.clone())
            .with_article_tags(article.id, tags);

        Self {
            storage,
            author,
            reader,
            article,
        }
    }

    /// Current association set of the seeded article.
    pub fn tags(&self) -> BTreeSet<String> {
        self.storage.article_tag_names(self.article.id)
    }

    pub fn favorites_count(&self) -> i64 {
        self.storage
            .article(self.article.id)
            .map(|a| a.favorites_count)
            .unwrap_or_default()
    }
}

#[allow(dead_code)]
pub fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| (*n).to_owned()).collect()
}

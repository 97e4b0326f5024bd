use crate::profiles::ProfileView;
use crate::storage::{ArticleRow, TagRow};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An article as returned to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleView {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    /// Sorted tag names.
    pub tag_list: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub favorited: bool,
    pub favorites_count: i64,
    pub author: ProfileView,
}

/// Combines an article row with its author, tags and the viewer's favorite
/// flag.
pub fn assemble(
    article: &ArticleRow,
    author: ProfileView,
    tags: &[TagRow],
    favorited: bool,
) -> ArticleView {
    let mut tag_list: Vec<String> = tags.iter().map(|t| t.name.clone()).collect();
    tag_list.sort();
    tag_list.dedup();

    ArticleView {
        slug: article.slug.clone(),
        title: article.title.clone(),
        description: article.description.clone(),
        body: article.body.clone(),
        tag_list,
        created_at: article.created_at,
        updated_at: article.updated_at,
        favorited,
        favorites_count: article.favorites_count,
        author,
    }
}

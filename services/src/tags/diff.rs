//! Pure planning step of tag reconciliation.

use crate::storage::TagRow;
use std::collections::BTreeSet;

/// Turns caller input into a set of tag names. Duplicates collapse, matching
/// is exact and case-sensitive.
pub fn normalize<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

/// Association changes needed to move an article to a requested tag set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPlan {
    pub to_add: Vec<TagRow>,
    pub to_remove: Vec<TagRow>,
    /// Requested names with no catalog entry.
    pub skipped: Vec<String>,
}

impl TagPlan {
    pub fn has_writes(&self) -> bool {
        !self.to_add.is_empty() || !self.to_remove.is_empty()
    }
}

/// Computes the minimal add/remove sets.
///
/// `catalog` holds the catalog rows for the requested names and `current` the
/// tags the article is associated with now. The target set is
/// `requested ∩ catalog`.
pub fn plan(requested: &BTreeSet<String>, catalog: &[TagRow], current: &[TagRow]) -> TagPlan {
    let resolved: BTreeSet<&str> = catalog
        .iter()
        .filter(|t| requested.contains(&t.name))
        .map(|t| t.name.as_str())
        .collect();
    let associated: BTreeSet<&str> = current.iter().map(|t| t.name.as_str()).collect();

    let mut to_add: Vec<TagRow> = catalog
        .iter()
        .filter(|t| resolved.contains(t.name.as_str()) && !associated.contains(t.name.as_str()))
        .cloned()
        .collect();
    to_add.sort_by(|a, b| a.name.cmp(&b.name));
    to_add.dedup_by(|a, b| a.name == b.name);

    let mut to_remove: Vec<TagRow> = current
        .iter()
        .filter(|t| !resolved.contains(t.name.as_str()))
        .cloned()
        .collect();
    to_remove.sort_by(|a, b| a.name.cmp(&b.name));

    let skipped = requested
        .iter()
        .filter(|name| !resolved.contains(name.as_str()))
        .cloned()
        .collect();

    TagPlan {
        to_add,
        to_remove,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(names: &[&str]) -> Vec<TagRow> {
        names.iter().map(|n| TagRow::new(*n)).collect()
    }

    fn names(tags: &[TagRow]) -> Vec<&str> {
        tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_normalize_drops_duplicates_and_keeps_case() {
        let set = normalize(["Rust", "rust", "rust", "go"]);
        assert_eq!(set.len(), 3);
        assert!(set.contains("Rust"));
        assert!(set.contains("rust"));
    }

    #[test]
    fn test_plan_minimal_swap() {
        let catalog = rows(&["b", "c"]);
        let current = rows(&["a", "b"]);
        let plan = plan(&normalize(["b", "c"]), &catalog, &current);

        assert_eq!(names(&plan.to_add), vec!["c"]);
        assert_eq!(names(&plan.to_remove), vec!["a"]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_plan_skips_names_missing_from_catalog() {
        let catalog = rows(&["go", "rust"]);
        let current = rows(&["go", "web"]);
        let plan = plan(&normalize(["go", "rust", "python"]), &catalog, &current);

        assert_eq!(names(&plan.to_add), vec!["rust"]);
        assert_eq!(names(&plan.to_remove), vec!["web"]);
        assert_eq!(plan.skipped, vec!["python".to_owned()]);
    }

    #[test]
    fn test_plan_same_set_has_no_writes() {
        let current = rows(&["go", "rust"]);
        let plan = plan(&normalize(["rust", "go"]), &current, &current);

        assert!(!plan.has_writes());
    }

    #[test]
    fn test_plan_empty_request_removes_everything() {
        let current = rows(&["go", "rust"]);
        let plan = plan(&BTreeSet::new(), &[], &current);

        assert!(plan.to_add.is_empty());
        assert_eq!(names(&plan.to_remove), vec!["go", "rust"]);
    }
}

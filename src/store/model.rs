//! Content Model
//!
//! Entries as readers see them, and the per-language payloads the write
//! commands carry.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator of the tag string carried by a save
pub const TAG_SEPARATOR: char = ',';

/// A blog entry with all its localizations and images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub uuid: Uuid,
    pub created: DateTime<Utc>,
    /// `None` means draft
    pub published: Option<DateTime<Utc>>,
    /// Localizations keyed by language code
    pub langs: BTreeMap<String, Localization>,
    /// Images ordered by number
    pub images: Vec<EntryImage>,
}

impl Entry {
    /// Image URIs joined by comma, `None` when the entry has no images
    pub fn image_uris(&self) -> Option<String> {
        if self.images.is_empty() {
            return None;
        }

        Some(
            self.images
                .iter()
                .map(|i| i.uri.as_str())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Localized text of an entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Localization {
    pub header: Option<String>,
    pub summary: Option<String>,
    pub body: Option<String>,
    pub slug: Option<String>,
    pub tags: Vec<String>,
}

/// An image attached to an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryImage {
    pub number: i64,
    pub uri: String,
}

/// Tag usage for the tag cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub content: String,
    pub posts: u64,
}

/// Per-language content of a save command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LangContent {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    /// Comma separated
    #[serde(default)]
    pub tags: Option<String>,
}

impl LangContent {
    /// Whether there is anything to store for this language
    pub fn has_content(&self) -> bool {
        [&self.header, &self.summary, &self.body]
            .into_iter()
            .any(|field| field.as_deref().map_or(false, |s| !s.is_empty()))
    }

    /// Slug to store, `None` when blank
    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Tags split on the separator and trimmed, in order, duplicates kept
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|tags| {
                tags.split(TAG_SEPARATOR)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Image payload of a set-images command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageParam {
    pub number: i64,
    pub uri: String,
}

/// Filter options for reading entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryFilter {
    pub langs: Option<Vec<String>>,
    pub slugs: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub uuids: Option<Vec<Uuid>>,
    pub published_after: Option<DateTime<Utc>>,
    pub published_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EntryFilter {
    /// Entries to return when no limit is given
    pub const DEFAULT_LIMIT: u32 = 10;

    /// Filter on a single entry id
    pub fn by_uuid(uuid: Uuid) -> Self {
        Self {
            uuids: Some(vec![uuid]),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_list() {
        let content = LangContent {
            tags: Some(" Taaags, Baags,Bag ladies , Bacon,,Bacon".to_string()),
            ..LangContent::default()
        };
        assert_eq!(
            content.tag_list(),
            vec!["Taaags", "Baags", "Bag ladies", "Bacon", "Bacon"]
        );

        assert!(LangContent::default().tag_list().is_empty());
    }

    #[test]
    fn test_has_content() {
        let mut content = LangContent {
            slug: Some("only-a-slug".to_string()),
            tags: Some("a,b".to_string()),
            header: Some(String::new()),
            ..LangContent::default()
        };
        assert!(!content.has_content());

        content.summary = Some("Something".to_string());
        assert!(content.has_content());
    }

    #[test]
    fn test_image_uris() {
        let mut entry = Entry {
            uuid: Uuid::new_v4(),
            created: Utc::now(),
            published: None,
            langs: BTreeMap::new(),
            images: vec![],
        };
        assert_eq!(entry.image_uris(), None);

        entry.images.push(EntryImage { number: 1, uri: "a".into() });
        entry.images.push(EntryImage { number: 2, uri: "b".into() });
        assert_eq!(entry.image_uris().as_deref(), Some("a,b"));
    }
}

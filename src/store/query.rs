//! Entry Queries
//!
//! Read side of the content store: filtered entry listing and the tag cloud.

use std::collections::{BTreeMap, HashMap};
use sqlx::{QueryBuilder, Sqlite};
use uuid::Uuid;

use super::model::{Entry, EntryFilter, EntryImage, Localization, TagCount};
use super::{from_millis, to_millis, uuid_from_blob, ContentStore};
use crate::error::Result;

#[derive(sqlx::FromRow)]
struct EntryRow {
    uuid: Vec<u8>,
    created: i64,
    published: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct DataRow {
    entry_uuid: Vec<u8>,
    lang: String,
    header: Option<String>,
    summary: Option<String>,
    body: Option<String>,
    slug: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TagRow {
    entry_uuid: Vec<u8>,
    lang: String,
    content: String,
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    entry_uuid: Vec<u8>,
    img_nr: i64,
    uri: String,
}

/// Append `<column> IN (?, ?, ...)`
fn push_in<'a, T>(qb: &mut QueryBuilder<'a, Sqlite>, column: &str, values: &'a [T])
where
    T: 'a + Send + sqlx::Encode<'a, Sqlite> + sqlx::Type<Sqlite>,
    &'a T: Send + sqlx::Encode<'a, Sqlite> + sqlx::Type<Sqlite>,
{
    qb.push(column);
    qb.push(" IN (");
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

impl ContentStore {
    /// Get entries matching the filter, newest publish first
    pub async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        tracing::trace!("get_entries called with {:?}", filter);

        let uuid_keys: Option<Vec<Vec<u8>>> = filter
            .uuids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.as_bytes().to_vec()).collect());

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT e.uuid, e.created, e.published FROM blog_entries e WHERE 1 = 1");

        // Only entries with content in the selected languages
        if let Some(langs) = &filter.langs {
            qb.push(" AND e.uuid IN (SELECT entry_uuid FROM blog_entry_data WHERE ");
            push_in(&mut qb, "lang", langs);
            qb.push(")");
        }

        if let Some(slugs) = &filter.slugs {
            qb.push(" AND e.uuid IN (SELECT entry_uuid FROM blog_entry_data WHERE ");
            push_in(&mut qb, "slug", slugs);
            qb.push(")");
        }

        if let Some(tags) = &filter.tags {
            qb.push(" AND e.uuid IN (SELECT entry_uuid FROM blog_entry_tags WHERE ");
            push_in(&mut qb, "content", tags);
            qb.push(")");
        }

        // An empty id list matches nothing
        if let Some(keys) = &uuid_keys {
            qb.push(" AND ");
            push_in(&mut qb, "e.uuid", keys);
        }

        if let Some(after) = &filter.published_after {
            qb.push(" AND e.published > ").push_bind(to_millis(after));
        }

        if let Some(before) = &filter.published_before {
            qb.push(" AND e.published < ").push_bind(to_millis(before));
        }

        qb.push(" ORDER BY e.published DESC, e.created DESC, e.uuid");
        qb.push(" LIMIT ")
            .push_bind(i64::from(filter.limit.unwrap_or(EntryFilter::DEFAULT_LIMIT)));
        qb.push(" OFFSET ")
            .push_bind(i64::from(filter.offset.unwrap_or(0)));

        let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(rows.len());
        let mut index: HashMap<Vec<u8>, usize> = HashMap::with_capacity(rows.len());
        for row in &rows {
            index.insert(row.uuid.clone(), entries.len());
            entries.push(Entry {
                uuid: uuid_from_blob(&row.uuid)?,
                created: from_millis(row.created)?,
                published: row.published.map(from_millis).transpose()?,
                langs: BTreeMap::new(),
                images: Vec::new(),
            });
        }
        let keys: Vec<Vec<u8>> = rows.into_iter().map(|r| r.uuid).collect();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT entry_uuid, lang, header, summary, body, slug FROM blog_entry_data WHERE ",
        );
        push_in(&mut qb, "entry_uuid", &keys);
        if let Some(langs) = &filter.langs {
            qb.push(" AND ");
            push_in(&mut qb, "lang", langs);
        }
        let data: Vec<DataRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        for row in data {
            if let Some(&i) = index.get(&row.entry_uuid) {
                entries[i].langs.insert(
                    row.lang,
                    Localization {
                        header: row.header,
                        summary: row.summary,
                        body: row.body,
                        slug: row.slug,
                        tags: Vec::new(),
                    },
                );
            }
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT entry_uuid, lang, content FROM blog_entry_tags WHERE ");
        push_in(&mut qb, "entry_uuid", &keys);
        qb.push(" ORDER BY entry_uuid, lang, tag_nr");
        let tags: Vec<TagRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        for row in tags {
            if let Some(&i) = index.get(&row.entry_uuid) {
                // Tags of languages filtered out have no localization to land in
                if let Some(localization) = entries[i].langs.get_mut(&row.lang) {
                    localization.tags.push(row.content);
                }
            }
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT entry_uuid, img_nr, uri FROM blog_entry_images WHERE ");
        push_in(&mut qb, "entry_uuid", &keys);
        qb.push(" ORDER BY entry_uuid, img_nr");
        let images: Vec<ImageRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        for row in images {
            if let Some(&i) = index.get(&row.entry_uuid) {
                entries[i].images.push(EntryImage {
                    number: row.img_nr,
                    uri: row.uri,
                });
            }
        }

        Ok(entries)
    }

    /// Tag usage per language, most used first
    pub async fn get_tags(&self) -> Result<BTreeMap<String, Vec<TagCount>>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT lang, content, COUNT(DISTINCT entry_uuid) AS posts
            FROM blog_entry_tags
            GROUP BY lang, content
            ORDER BY lang, posts DESC, content
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tags: BTreeMap<String, Vec<TagCount>> = BTreeMap::new();
        for (lang, content, posts) in rows {
            tags.entry(lang).or_default().push(TagCount {
                content,
                posts: posts as u64,
            });
        }

        Ok(tags)
    }

    /// Number of entries in the store
    pub async fn entry_count(&self) -> Result<u64> {
        self.count_rows(super::TABLE_ENTRIES).await
    }

    /// Whether an entry exists
    pub async fn entry_exists(&self, uuid: Uuid) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM blog_entries WHERE uuid = ?")
            .bind(uuid.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::LangContent;
    use crate::store::test_support::migrated_store;

    async fn seed(store: &ContentStore, published_ms: Option<i64>, lang: &str, slug: &str, tags: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut langs = BTreeMap::new();
        langs.insert(
            lang.to_string(),
            LangContent {
                header: Some(format!("Header {}", slug)),
                summary: None,
                body: Some("body".into()),
                slug: Some(slug.to_string()),
                tags: Some(tags.to_string()),
            },
        );
        let published = published_ms.map(|ms| from_millis(ms).unwrap());
        store.save_entry(id, Some(published), Some(&langs)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (_dir, store) = migrated_store().await;
        assert!(store.get_entries(&EntryFilter::default()).await.unwrap().is_empty());
        assert!(store.get_tags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters() {
        let (_dir, store) = migrated_store().await;
        let old = seed(&store, Some(1_000), "en", "old", "beer,bacon").await;
        let new = seed(&store, Some(2_000), "en", "new", "beer").await;
        let swedish = seed(&store, Some(3_000), "sv", "gammal", "öl").await;
        let draft = seed(&store, None, "en", "draft", "bacon").await;

        let all = store.get_entries(&EntryFilter::default()).await.unwrap();
        let order: Vec<Uuid> = all.iter().map(|e| e.uuid).collect();
        assert_eq!(order, vec![swedish, new, old, draft]);

        let english = store
            .get_entries(&EntryFilter { langs: Some(vec!["en".into()]), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(english.len(), 3);
        assert!(english.iter().all(|e| e.langs.contains_key("en")));

        let by_slug = store
            .get_entries(&EntryFilter { slugs: Some(vec!["new".into()]), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_slug.len(), 1);
        assert_eq!(by_slug[0].uuid, new);

        let bacon = store
            .get_entries(&EntryFilter { tags: Some(vec!["bacon".into()]), ..Default::default() })
            .await
            .unwrap();
        let ids: Vec<Uuid> = bacon.iter().map(|e| e.uuid).collect();
        assert_eq!(ids, vec![old, draft]);

        let window = store
            .get_entries(&EntryFilter {
                published_after: Some(from_millis(1_500).unwrap()),
                published_before: Some(from_millis(2_500).unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].uuid, new);

        let page = store
            .get_entries(&EntryFilter { limit: Some(2), offset: Some(1), ..Default::default() })
            .await
            .unwrap();
        let ids: Vec<Uuid> = page.iter().map(|e| e.uuid).collect();
        assert_eq!(ids, vec![new, old]);

        let none = store
            .get_entries(&EntryFilter { uuids: Some(vec![]), ..Default::default() })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_tag_cloud() {
        let (_dir, store) = migrated_store().await;
        seed(&store, Some(1), "en", "one", "beer,bacon").await;
        seed(&store, Some(2), "en", "two", "beer").await;
        seed(&store, Some(3), "sv", "tre", "öl").await;

        let tags = store.get_tags().await.unwrap();
        assert_eq!(tags["en"][0], TagCount { content: "beer".into(), posts: 2 });
        assert_eq!(tags["en"][1], TagCount { content: "bacon".into(), posts: 1 });
        assert_eq!(tags["sv"].len(), 1);
    }

    #[tokio::test]
    async fn test_entry_exists() {
        let (_dir, store) = migrated_store().await;
        let id = seed(&store, None, "en", "x", "").await;
        assert!(store.entry_exists(id).await.unwrap());
        assert!(!store.entry_exists(Uuid::new_v4()).await.unwrap());
        assert_eq!(store.entry_count().await.unwrap(), 1);
    }
}

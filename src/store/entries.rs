//! Entry Writes
//!
//! The three mutations behind the write commands. Each runs inside a single
//! transaction, so the delete-then-insert replacement of localizations,
//! tags and images is never observed half done.

use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{ImageParam, LangContent};
use super::{to_millis, uuid_from_blob, ContentStore};
use crate::error::{Error, Result};

impl ContentStore {
    /// Create the entry if unknown, then replace the given languages.
    ///
    /// `published`: `None` leaves the publish time untouched, `Some(None)`
    /// unpublishes. Languages missing from `langs` are left as they are; a
    /// language whose header, summary and body are all empty is removed.
    pub async fn save_entry(
        &self,
        uuid: Uuid,
        published: Option<Option<DateTime<Utc>>>,
        langs: Option<&BTreeMap<String, LangContent>>,
    ) -> Result<()> {
        let key = uuid.as_bytes().to_vec();
        let mut tx = self.pool.begin().await?;

        // Reject slug collisions before anything is written
        if let Some(langs) = langs {
            for (lang, content) in langs {
                if !content.has_content() {
                    continue;
                }
                let Some(slug) = content.slug() else { continue };

                let owner: Option<(Vec<u8>,)> = sqlx::query_as(
                    "SELECT entry_uuid FROM blog_entry_data WHERE lang = ? AND slug = ? AND entry_uuid <> ?",
                )
                .bind(lang)
                .bind(slug)
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some((owner,)) = owner {
                    return Err(Error::SlugConflict {
                        lang: lang.clone(),
                        slug: slug.to_string(),
                        owner: uuid_from_blob(&owner)?,
                    });
                }
            }
        }

        let initial_published = published.flatten().map(|p| to_millis(&p));
        let created = sqlx::query(
            "INSERT OR IGNORE INTO blog_entries (uuid, created, published) VALUES (?, ?, ?)",
        )
        .bind(&key)
        .bind(to_millis(&Utc::now()))
        .bind(initial_published)
        .execute(&mut *tx)
        .await?;

        if created.rows_affected() == 1 {
            tracing::debug!("New blog entry created with uuid {}", uuid);
        }

        if let Some(published) = published {
            sqlx::query("UPDATE blog_entries SET published = ? WHERE uuid = ?")
                .bind(published.map(|p| to_millis(&p)))
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(langs) = langs {
            for (lang, content) in langs {
                sqlx::query("DELETE FROM blog_entry_tags WHERE entry_uuid = ? AND lang = ?")
                    .bind(&key)
                    .bind(lang)
                    .execute(&mut *tx)
                    .await?;

                sqlx::query("DELETE FROM blog_entry_data WHERE entry_uuid = ? AND lang = ?")
                    .bind(&key)
                    .bind(lang)
                    .execute(&mut *tx)
                    .await?;

                if !content.has_content() {
                    tracing::debug!("Entry {} has no {} content, language removed", uuid, lang);
                    continue;
                }

                sqlx::query(
                    "INSERT INTO blog_entry_data (entry_uuid, lang, header, summary, body, slug) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&key)
                .bind(lang)
                .bind(content.header.as_deref())
                .bind(content.summary.as_deref())
                .bind(content.body.as_deref())
                .bind(content.slug())
                .execute(&mut *tx)
                .await?;

                for (tag_nr, tag) in content.tag_list().iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO blog_entry_tags (entry_uuid, lang, tag_nr, content) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&key)
                    .bind(lang)
                    .bind(tag_nr as i64)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove an entry with everything hanging off it. Unknown ids are fine.
    pub async fn rm_entry(&self, uuid: Uuid) -> Result<u64> {
        let key = uuid.as_bytes().to_vec();
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for sql in [
            "DELETE FROM blog_entry_tags WHERE entry_uuid = ?",
            "DELETE FROM blog_entry_images WHERE entry_uuid = ?",
            "DELETE FROM blog_entry_data WHERE entry_uuid = ?",
            "DELETE FROM blog_entries WHERE uuid = ?",
        ] {
            removed += sqlx::query(sql)
                .bind(&key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        tracing::debug!("Removed entry {} ({} rows)", uuid, removed);
        Ok(removed)
    }

    /// Replace the image set of an entry.
    ///
    /// With `delete_existing` off the images are merged in, an image number
    /// already present gets its URI replaced. A number given twice in one
    /// call is rejected before anything is written.
    pub async fn set_images(
        &self,
        uuid: Uuid,
        images: &[ImageParam],
        delete_existing: bool,
    ) -> Result<()> {
        let mut numbers = BTreeSet::new();
        if let Some(image) = images.iter().find(|image| !numbers.insert(image.number)) {
            return Err(Error::DuplicateImageNumber(image.number));
        }

        let key = uuid.as_bytes().to_vec();
        let mut tx = self.pool.begin().await?;

        if delete_existing {
            sqlx::query("DELETE FROM blog_entry_images WHERE entry_uuid = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }

        for image in images {
            sqlx::query(
                "INSERT OR REPLACE INTO blog_entry_images (entry_uuid, img_nr, uri) VALUES (?, ?, ?)",
            )
            .bind(&key)
            .bind(image.number)
            .bind(&image.uri)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::migrated_store;
    use crate::store::{EntryFilter, TABLE_ENTRIES, TABLE_ENTRY_TAGS};

    fn lang(header: &str, slug: &str, tags: &str) -> LangContent {
        LangContent {
            header: Some(header.to_string()),
            summary: Some(format!("{} summary", header)),
            body: Some(format!("{} body", header)),
            slug: Some(slug.to_string()),
            tags: Some(tags.to_string()),
        }
    }

    fn langs(pairs: Vec<(&str, LangContent)>) -> BTreeMap<String, LangContent> {
        pairs.into_iter().map(|(l, c)| (l.to_string(), c)).collect()
    }

    #[tokio::test]
    async fn test_save_and_update_entry() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();

        let first = langs(vec![
            ("en", lang("Bacon", "bacon", "a, b")),
            ("sv", lang("Fläsk", "flask", "c")),
        ]);
        store.save_entry(id, None, Some(&first)).await.unwrap();

        // Second save only touches English
        let second = langs(vec![("en", lang("More bacon", "more-bacon", "d"))]);
        store.save_entry(id, None, Some(&second)).await.unwrap();

        let entries = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.published, None);
        assert_eq!(entry.langs["en"].header.as_deref(), Some("More bacon"));
        assert_eq!(entry.langs["en"].tags, vec!["d"]);
        assert_eq!(entry.langs["sv"].slug.as_deref(), Some("flask"));
        assert_eq!(entry.langs["sv"].tags, vec!["c"]);
        assert_eq!(store.count_rows(TABLE_ENTRIES).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_published_tri_state() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();
        let when = crate::store::from_millis(1_700_000_000_000).unwrap();

        store.save_entry(id, Some(Some(when)), None).await.unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.published, Some(when));
        let created = entry.created;

        // Absent keeps it, the row is never re-created
        store.save_entry(id, None, None).await.unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.published, Some(when));
        assert_eq!(entry.created, created);

        store.save_entry(id, Some(None), None).await.unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.published, None);
    }

    #[tokio::test]
    async fn test_slug_conflict_leaves_no_trace() {
        let (_dir, store) = migrated_store().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store
            .save_entry(first, None, Some(&langs(vec![("en", lang("One", "same", "x"))])))
            .await
            .unwrap();
        let before = store.get_entries(&EntryFilter::by_uuid(first)).await.unwrap();

        let err = store
            .save_entry(
                second,
                None,
                Some(&langs(vec![
                    ("de", lang("Zwei", "zwei", "y")),
                    ("en", lang("Two", "same", "z")),
                ])),
            )
            .await
            .unwrap_err();
        match err {
            Error::SlugConflict { lang, slug, owner } => {
                assert_eq!(lang, "en");
                assert_eq!(slug, "same");
                assert_eq!(owner, first);
            }
            other => panic!("Expected SlugConflict, got {}", other),
        }

        // Nothing of the second entry was written
        assert!(store.get_entries(&EntryFilter::by_uuid(second)).await.unwrap().is_empty());
        assert_eq!(store.count_rows(TABLE_ENTRIES).await.unwrap(), 1);
        let after = store.get_entries(&EntryFilter::by_uuid(first)).await.unwrap();
        assert_eq!(before, after);

        // Same slug in another language is fine
        store
            .save_entry(second, None, Some(&langs(vec![("sv", lang("Två", "same", ""))])))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resave_own_slug() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();
        let content = langs(vec![("en", lang("One", "one", "x"))]);

        store.save_entry(id, None, Some(&content)).await.unwrap();
        store.save_entry(id, None, Some(&content)).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_language_is_removed() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();

        store
            .save_entry(id, None, Some(&langs(vec![("en", lang("One", "one", "x,y"))])))
            .await
            .unwrap();
        store
            .save_entry(id, None, Some(&langs(vec![("en", LangContent::default())])))
            .await
            .unwrap();

        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert!(entry.langs.is_empty());
        assert_eq!(store.count_rows(TABLE_ENTRY_TAGS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rm_entry() {
        let (_dir, store) = migrated_store().await;
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();

        for (id, slug) in [(keep, "keep"), (gone, "gone")] {
            store
                .save_entry(id, None, Some(&langs(vec![("en", lang("E", slug, "t"))])))
                .await
                .unwrap();
            store
                .set_images(id, &[ImageParam { number: 1, uri: "/a.png".into() }], true)
                .await
                .unwrap();
        }

        assert!(store.rm_entry(gone).await.unwrap() >= 4);
        assert!(store.get_entries(&EntryFilter::by_uuid(gone)).await.unwrap().is_empty());

        // Unknown ids delete nothing and succeed
        assert_eq!(store.rm_entry(Uuid::new_v4()).await.unwrap(), 0);

        let kept = store.get_entries(&EntryFilter::by_uuid(keep)).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].image_uris().as_deref(), Some("/a.png"));
    }

    #[tokio::test]
    async fn test_set_images() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();
        store.save_entry(id, None, None).await.unwrap();

        let images = vec![
            ImageParam { number: 2, uri: "b".into() },
            ImageParam { number: 1, uri: "a".into() },
        ];
        store.set_images(id, &images, true).await.unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.image_uris().as_deref(), Some("a,b"));

        // Merge without delete replaces by number
        store
            .set_images(id, &[ImageParam { number: 2, uri: "c".into() }], false)
            .await
            .unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.image_uris().as_deref(), Some("a,c"));

        store.set_images(id, &[], true).await.unwrap();
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.image_uris(), None);
    }

    #[tokio::test]
    async fn test_duplicate_image_numbers_rejected() {
        let (_dir, store) = migrated_store().await;
        let id = Uuid::new_v4();
        store.save_entry(id, None, None).await.unwrap();
        store
            .set_images(id, &[ImageParam { number: 1, uri: "kept".into() }], true)
            .await
            .unwrap();

        let images = vec![
            ImageParam { number: 1, uri: "a".into() },
            ImageParam { number: 2, uri: "b".into() },
            ImageParam { number: 1, uri: "c".into() },
        ];
        let result = store.set_images(id, &images, true).await;
        assert!(matches!(result, Err(Error::DuplicateImageNumber(1))));

        // Nothing was deleted or merged
        let entry = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap().remove(0);
        assert_eq!(entry.image_uris().as_deref(), Some("kept"));
    }
}

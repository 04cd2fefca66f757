#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::model::Item;
    use anyhow::anyhow;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use uuid::Uuid;

    fn rows(range: std::ops::Range<usize>) -> Vec<serde_json::Value> {
        range.map(|n| json!({ "n": n })).collect()
    }

    fn page_of(range: std::ops::Range<usize>, total: usize) -> ViewPage {
        ViewPage {
            rows: rows(range),
            total,
        }
    }

    #[tokio::test]
    async fn identical_loads_share_one_request() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let key = ViewKey::new(slots::FOLDERS);
        let first = {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .load(key, move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = started_tx.send(());
                        async move {
                            let _ = release_rx.await;
                            Ok(page_of(0..3, 3))
                        }
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let second = {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .load(key, move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(ViewPage::default()) }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a.snapshot().unwrap().rows.len(), 3);
    }

    #[tokio::test]
    async fn newer_key_in_slot_supersedes_older_request() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let g1 = Uuid::new_v4();
        let g2 = Uuid::new_v4();

        let older = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .load(ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(g1), move |_| {
                        let _ = started_tx.send(());
                        futures::future::pending::<anyhow::Result<ViewPage>>()
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let newer = cache
            .load(ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(g2), |_| async {
                Ok(page_of(0..1, 1))
            })
            .await
            .unwrap();

        assert_eq!(older.await.unwrap().unwrap(), ViewLoad::Superseded);
        let snapshot = newer.into_snapshot().unwrap();
        assert_eq!(snapshot.path, format!("notebook-notes/{g2}"));
        assert!(!cache.contains(&ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(g1)));
    }

    #[tokio::test]
    async fn cache_hit_supersedes_other_request_in_slot() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let parent = Uuid::new_v4();
        let plain = ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(parent);
        cache
            .load(plain.clone(), |_| async { Ok(page_of(0..2, 2)) })
            .await
            .unwrap();

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let searching = {
            let cache = cache.clone();
            let key = plain.clone().with_search("x");
            tokio::spawn(async move {
                cache
                    .load(key, move |_| {
                        let _ = started_tx.send(());
                        async move {
                            let _ = release_rx.await;
                            Ok(ViewPage {
                                rows: vec![json!({ "tag": "search-x" })],
                                total: 1,
                            })
                        }
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let hit = cache
            .load(plain.clone(), |_| async { Err(anyhow!("not expected")) })
            .await
            .unwrap();
        assert!(matches!(hit, ViewLoad::Ready(ref s) if s.rows == rows(0..2)));

        let _ = release_tx.send(());
        assert_eq!(searching.await.unwrap().unwrap(), ViewLoad::Superseded);

        let again = cache
            .load(plain, |_| async { Err(anyhow!("not expected")) })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(again.rows, rows(0..2));
        assert_eq!(again.query.search, None);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_fetching() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let key = ViewKey::new(slots::FOLDERS);
        cache
            .load(key.clone(), |_| async { Ok(page_of(0..2, 2)) })
            .await
            .unwrap();

        let again = cache
            .load(key, |_| async { Err(anyhow!("should not be called")) })
            .await
            .unwrap();
        assert!(matches!(again, ViewLoad::Ready(ref s) if s.rows.len() == 2 && !s.stale));
    }

    #[tokio::test]
    async fn expired_entry_is_served_stale_and_refreshed() {
        let cache = ViewCache::new(Duration::ZERO);
        let key = ViewKey::new(slots::FOLDERS);
        cache
            .load(key.clone(), |_| async { Ok(page_of(0..1, 1)) })
            .await
            .unwrap();

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let stale = cache
            .load(key.clone(), move |_| async move {
                let _ = done_tx.send(());
                Ok(page_of(0..4, 4))
            })
            .await
            .unwrap();
        match stale {
            ViewLoad::Stale(s) => {
                assert!(s.stale);
                assert_eq!(s.rows.len(), 1);
            }
            other => panic!("expected stale, got {other:?}"),
        }

        done_rx.await.unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
            let rows = cache.inner.lock().entries[&key.entry_key()].rows.len();
            if rows == 4 {
                return;
            }
        }
        panic!("background refresh never landed");
    }

    #[tokio::test]
    async fn next_page_appends_to_cached_rows() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let parent = Uuid::new_v4();
        let base = ViewKey::new(slots::NOTEBOOK_NOTES)
            .with_parent(parent)
            .with_sort(SortOrder::Title);

        let first = cache
            .load(base.clone().page(0, 2), |_| async { Ok(page_of(0..2, 5)) })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert!(first.has_more());

        let second = cache
            .load(base.clone().page(2, 2), |key| async move {
                assert_eq!(key.page.offset, 2);
                Ok(page_of(2..4, 5))
            })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(second.rows, rows(0..4));
        assert_eq!(second.total, 5);

        // Already covered: no fetch.
        let covered = cache
            .load(base.page(0, 4), |_| async { Err(anyhow!("not expected")) })
            .await
            .unwrap();
        assert!(matches!(covered, ViewLoad::Ready(_)));
    }

    #[tokio::test]
    async fn later_page_on_cold_cache_is_not_cached() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let base = ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(Uuid::new_v4());

        let late = cache
            .load(base.clone().page(50, 50), |_| async { Ok(page_of(50..60, 60)) })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(late.rows, rows(50..60));
        assert!(!cache.contains(&base));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let head = cache
            .load(base.page(0, 5), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(page_of(0..5, 60)) }
            })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(head.rows[0], json!({ "n": 0 }));
    }

    #[tokio::test]
    async fn query_change_replaces_rows() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let parent = Uuid::new_v4();
        let key = ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(parent);
        cache
            .load(key.clone().page(0, 3), |_| async { Ok(page_of(0..3, 9)) })
            .await
            .unwrap();

        let searched = cache
            .load(key.with_search("wave").page(0, 3), |_| async {
                Ok(page_of(7..8, 1))
            })
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(searched.rows, rows(7..8));
        assert_eq!(searched.query.search.as_deref(), Some("wave"));
    }

    #[tokio::test]
    async fn invalidate_drops_matching_paths_only() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let g = Uuid::new_v4();
        let other = Uuid::new_v4();
        for key in [
            ViewKey::new(slots::FOLDERS),
            ViewKey::new(slots::NOTEBOOK_NOTES).with_parent(g),
            ViewKey::new(slots::FOLDER_NOTEBOOKS).with_parent(other),
        ] {
            cache
                .load(key, |_| async { Ok(page_of(0..1, 1)) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.invalidate(&format!("notebook-notes/{g}")), 1);
        assert_eq!(cache.invalidate("notebook"), 0);
        assert_eq!(cache.invalidate_parent(&other.to_string()), 1);
        assert!(cache.contains(&ViewKey::new(slots::FOLDERS)));
        cache.clear_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn response_of_invalidated_request_is_not_cached() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let key = ViewKey::new(slots::FOLDERS);

        let pending = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .load(key, move |_| {
                        let _ = started_tx.send(());
                        async move {
                            let _ = release_rx.await;
                            Ok(page_of(0..2, 2))
                        }
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        cache.invalidate(slots::FOLDERS);
        release_tx.send(()).unwrap();

        let load = pending.await.unwrap().unwrap();
        assert_eq!(load.snapshot().unwrap().rows.len(), 2);
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn fetch_error_frees_the_slot() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let key = ViewKey::new(slots::FOLDERS);
        let err = cache
            .load(key.clone(), |_| async { Err(anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let retry = cache
            .load(key, |_| async { Ok(page_of(0..1, 1)) })
            .await
            .unwrap();
        assert!(matches!(retry, ViewLoad::Ready(_)));
    }

    #[test]
    fn item_change_touches_list_and_summary_views() {
        let now = Utc::now();
        let (c, g, i) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let item = Entity::Item(Item {
            id: i.into(),
            owner_id: "u1".into(),
            group_id: g.into(),
            collection_id: c.into(),
            title: "Waves".into(),
            content: String::new(),
            position: 1000.0,
            created_at: now,
            updated_at: now,
        });
        assert_eq!(
            affected_paths(&item),
            vec![
                "folders".to_string(),
                format!("folder-notebooks/{c}"),
                format!("notebook-notes/{g}"),
                format!("note/{i}"),
            ]
        );
    }

    #[test]
    fn view_key_serializes_flat() {
        let key = ViewKey::new(slots::NOTEBOOK_NOTES)
            .with_parent("abc")
            .with_search("  ")
            .with_sort(SortOrder::Manual)
            .page(10, 5);
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(
            value,
            json!({
                "slot": "notebook-notes",
                "parent": "abc",
                "sort": "manual",
                "include_archived": false,
                "offset": 10,
                "limit": 5
            })
        );
        assert!(prefix_matches("notebook-notes/abc", "notebook-notes"));
        assert!(!prefix_matches("notebook-notesx", "notebook-notes"));
    }
}

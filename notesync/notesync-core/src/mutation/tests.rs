#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::backend::{FaultOp, MemoryBackend};
    use crate::error::BackendError;
    use crate::projection::NotebookSummary;
    use crate::view::{slots, ViewKey, ViewPage};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Harness {
        store: Arc<EntityStore>,
        views: Arc<ViewCache>,
        backend: MemoryBackend,
        client: Arc<dyn Backend>,
        mutations: MutationManager,
    }

    fn harness() -> Harness {
        let backend = MemoryBackend::new();
        let user = UserContext::new("alice", "alice@example.com");
        let client: Arc<dyn Backend> = Arc::new(backend.connect(user.clone()));
        harness_with(backend, client, user, false)
    }

    fn harness_with(
        backend: MemoryBackend,
        client: Arc<dyn Backend>,
        user: UserContext,
        serialize: bool,
    ) -> Harness {
        let store = Arc::new(EntityStore::new());
        let views = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let mutations = MutationManager::new(
            Arc::clone(&store),
            Arc::clone(&views),
            Arc::clone(&client),
            user,
        )
        .serialize_same_entity(serialize);
        Harness {
            store,
            views,
            backend,
            client,
            mutations,
        }
    }

    fn position(store: &EntityStore, id: EntityId) -> f64 {
        match store.get(EntityKind::Item, id) {
            Some(Entity::Item(item)) => item.position,
            other => panic!("expected item, got {other:?}"),
        }
    }

    /// Backend whose updates wait for a permit, to hold a mutation in flight.
    struct GatedBackend {
        inner: Arc<dyn Backend>,
        gate: Semaphore,
    }

    #[async_trait]
    impl Backend for GatedBackend {
        async fn list(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>> {
            self.inner.list(kind, filter).await
        }
        async fn get_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<Entity>> {
            self.inner.get_by_id(kind, id).await
        }
        async fn create(&self, candidate: &Entity) -> Result<Entity> {
            self.inner.create(candidate).await
        }
        async fn update(&self, kind: EntityKind, id: Uuid, patch: &EntityPatch) -> Result<Entity> {
            self.gate.acquire().await?.forget();
            self.inner.update(kind, id, patch).await
        }
        async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<()> {
            self.inner.delete(kind, id).await
        }
        async fn delete_where(&self, kind: EntityKind, filter: &Filter) -> Result<usize> {
            self.inner.delete_where(kind, filter).await
        }
        async fn fetch_view(&self, key: &ViewKey) -> Result<ViewPage> {
            self.inner.fetch_view(key).await
        }
    }

    #[tokio::test]
    async fn create_replaces_temp_entity_with_server_copy() {
        let h = harness();
        let created = h.mutations.create_collection("  Work ", None).await.unwrap();

        assert!(!created.id().is_temp());
        assert_eq!(created.owner_id(), "alice");
        assert_eq!(h.store.len(EntityKind::Collection), 1);
        assert_eq!(h.store.get(EntityKind::Collection, created.id()), Some(created.clone()));
        let Entity::Collection(c) = created else {
            panic!("expected collection");
        };
        assert_eq!(c.name, "Work");
        assert_eq!(c.color, DEFAULT_COLOR);
    }

    #[tokio::test]
    async fn optimistic_create_is_visible_before_the_backend_answers() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "Physics").await.unwrap();

        let group_id = g.id();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.store.subscribe(
            move |view| view.items_in(group_id).iter().map(|i| i.id).collect::<Vec<_>>(),
            move |ids: &Vec<EntityId>| sink.lock().push(ids.clone()),
        );
        let item = h.mutations.create_item(group_id, "Waves", "").await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0][0].is_temp());
        assert_eq!(seen[1], vec![item.id()]);
    }

    #[tokio::test]
    async fn failed_create_rolls_back() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let before = h.store.snapshot();

        h.backend.fail_next(FaultOp::Create, Some(EntityKind::Group));
        let err = h.mutations.create_group(c.id(), "Physics").await.unwrap_err();

        match &err {
            SyncError::DurableWrite {
                op, kind, attempted, ..
            } => {
                assert_eq!(*op, MutationOp::Create);
                assert_eq!(*kind, EntityKind::Group);
                assert_eq!(attempted["name"], "Physics");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_recoverable());
        assert!(matches!(err.backend_error(), Some(BackendError::Unavailable(_))));
        assert_eq!(h.store.snapshot(), before);
        assert!(h.backend.dump(EntityKind::Group).is_empty());
    }

    #[tokio::test]
    async fn failed_update_restores_previous_state() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let before = h.store.snapshot();

        h.backend.fail_next(FaultOp::Update, None);
        let err = h
            .mutations
            .rename(EntityKind::Collection, c.id(), "Play")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::DurableWrite { op: MutationOp::Update, .. }));
        assert_eq!(h.store.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_group_move_restores_item_collection_ids() {
        let h = harness();
        let from = h.mutations.create_collection("From", None).await.unwrap();
        let to = h.mutations.create_collection("To", None).await.unwrap();
        let g = h.mutations.create_group(from.id(), "Physics").await.unwrap();
        h.mutations.create_item(g.id(), "Waves", "").await.unwrap();
        h.mutations.create_item(g.id(), "Optics", "").await.unwrap();
        let before = h.store.snapshot();

        h.backend.fail_next(FaultOp::Update, Some(EntityKind::Group));
        assert!(h.mutations.move_group(g.id(), to.id()).await.is_err());
        assert_eq!(h.store.snapshot(), before);

        let moved = h.mutations.move_group(g.id(), to.id()).await.unwrap().unwrap();
        assert_eq!(moved.collection_id(), to.id());
        h.store.read(|view| {
            for item in view.items_in(g.id()) {
                assert_eq!(item.collection_id, to.id());
            }
        });
        h.store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn deleting_collection_cascades_to_every_descendant() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        for name in ["Physics", "Maths"] {
            let g = h.mutations.create_group(c.id(), name).await.unwrap();
            h.mutations.create_item(g.id(), "One", "").await.unwrap();
            h.mutations.create_item(g.id(), "Two", "").await.unwrap();
        }
        assert_eq!(h.store.snapshot_subtree(EntityKind::Collection, c.id()).len(), 2 + 4 + 1);

        h.mutations.delete(EntityKind::Collection, c.id()).await.unwrap();

        assert!(h.store.is_empty());
        h.store.check_invariants().unwrap();
        for kind in EntityKind::ALL {
            assert!(h.backend.dump(kind).is_empty(), "{kind} rows left behind");
        }
    }

    #[tokio::test]
    async fn partial_cascade_failure_restores_full_snapshot() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        for name in ["Physics", "Maths", "History"] {
            let g = h.mutations.create_group(c.id(), name).await.unwrap();
            h.mutations.create_item(g.id(), "Notes", "body").await.unwrap();
        }
        let before = h.store.snapshot();

        // Items go first and succeed; the group batch fails.
        h.backend.fail_next(FaultOp::DeleteWhere, Some(EntityKind::Group));
        let err = h
            .mutations
            .delete(EntityKind::Collection, c.id())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::DurableWrite { op: MutationOp::Delete, .. }));
        assert_eq!(h.store.snapshot(), before);
        assert_eq!(h.store.snapshot_subtree(EntityKind::Collection, c.id()).len(), 3 + 3 + 1);
        h.store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn positions_follow_gap_midpoint_and_head_rules() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "Physics").await.unwrap();

        let first = h.mutations.create_item(g.id(), "First", "").await.unwrap();
        let second = h.mutations.create_item(g.id(), "Second", "").await.unwrap();
        let third = h.mutations.create_item(g.id(), "Third", "").await.unwrap();
        assert_eq!(position(&h.store, first.id()), 1000.0);
        assert_eq!(position(&h.store, second.id()), 2000.0);
        assert_eq!(position(&h.store, third.id()), 3000.0);

        h.mutations
            .reorder_item(third.id(), Some(first.id()), Some(second.id()))
            .await
            .unwrap();
        assert_eq!(position(&h.store, third.id()), 1500.0);

        h.mutations
            .reorder_item(second.id(), None, Some(first.id()))
            .await
            .unwrap();
        assert_eq!(position(&h.store, second.id()), 500.0);

        h.mutations
            .reorder_item(second.id(), Some(third.id()), None)
            .await
            .unwrap();
        assert_eq!(position(&h.store, second.id()), 2500.0);
    }

    #[tokio::test]
    async fn exhausted_midpoint_respaces_the_group() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "Physics").await.unwrap();
        let a = h.mutations.create_item(g.id(), "A", "").await.unwrap();
        let b = h.mutations.create_item(g.id(), "B", "").await.unwrap();
        let moving = h.mutations.create_item(g.id(), "C", "").await.unwrap();

        for (id, pos) in [(a.id(), 1.0_f64), (b.id(), f64::from_bits(1.0_f64.to_bits() + 1))] {
            h.mutations
                .update(
                    EntityKind::Item,
                    id,
                    EntityPatch::Item(ItemPatch {
                        position: Some(pos),
                        ..Default::default()
                    }),
                )
                .await
                .unwrap();
        }

        h.mutations
            .reorder_item(moving.id(), Some(a.id()), Some(b.id()))
            .await
            .unwrap();

        assert_eq!(position(&h.store, a.id()), 1000.0);
        assert_eq!(position(&h.store, moving.id()), 2000.0);
        assert_eq!(position(&h.store, b.id()), 3000.0);
    }

    #[tokio::test]
    async fn reorder_rejects_non_siblings() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g1 = h.mutations.create_group(c.id(), "One").await.unwrap();
        let g2 = h.mutations.create_group(c.id(), "Two").await.unwrap();
        let here = h.mutations.create_item(g1.id(), "Here", "").await.unwrap();
        let there = h.mutations.create_item(g2.id(), "There", "").await.unwrap();

        let err = h
            .mutations
            .reorder_item(here.id(), Some(there.id()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn move_item_appends_to_target_group() {
        let h = harness();
        let c1 = h.mutations.create_collection("One", None).await.unwrap();
        let c2 = h.mutations.create_collection("Two", None).await.unwrap();
        let g1 = h.mutations.create_group(c1.id(), "Source").await.unwrap();
        let g2 = h.mutations.create_group(c2.id(), "Target").await.unwrap();
        h.mutations.create_item(g2.id(), "Existing", "").await.unwrap();
        let note = h.mutations.create_item(g1.id(), "Moving", "").await.unwrap();

        let moved = h.mutations.move_item(note.id(), g2.id()).await.unwrap().unwrap();
        let Entity::Item(item) = moved else {
            panic!("expected item");
        };
        assert_eq!(item.group_id, g2.id());
        assert_eq!(item.collection_id, c2.id());
        assert_eq!(item.position, 2000.0);
        assert_eq!(h.store.read(|view| view.items_in(g1.id()).len()), 0);
        h.store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn archive_and_unarchive_group() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "Old").await.unwrap();

        let archived = h.mutations.archive_group(g.id()).await.unwrap().unwrap();
        let group = archived.as_group().unwrap();
        assert!(group.archived);
        assert!(group.archived_at.is_some());

        let restored = h.mutations.unarchive_group(g.id()).await.unwrap().unwrap();
        let group = restored.as_group().unwrap();
        assert!(!group.archived);
        assert!(group.archived_at.is_none());
    }

    #[tokio::test]
    async fn validation_fails_before_any_local_change() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "Physics").await.unwrap();
        let before = h.store.snapshot();

        let failures = vec![
            h.mutations.create_collection("   ", None).await.unwrap_err(),
            h.mutations.create_group(EntityId::Temp(99), "Ghost").await.unwrap_err(),
            h.mutations
                .create_group(Uuid::new_v4().into(), "Orphan")
                .await
                .unwrap_err(),
            h.mutations.create_item(g.id(), "", "").await.unwrap_err(),
            h.mutations
                .rename(EntityKind::Group, g.id(), "")
                .await
                .unwrap_err(),
            h.mutations
                .update(
                    EntityKind::Group,
                    g.id(),
                    EntityPatch::Item(ItemPatch::default()),
                )
                .await
                .unwrap_err(),
        ];
        for err in &failures {
            assert!(matches!(err, SyncError::Validation(_)), "{err}");
        }
        assert_eq!(h.store.snapshot(), before);
    }

    #[tokio::test]
    async fn missing_targets_are_no_ops() {
        let h = harness();
        let ghost = EntityId::Durable(Uuid::new_v4());
        assert_eq!(
            h.mutations
                .rename(EntityKind::Collection, ghost, "Nothing")
                .await
                .unwrap(),
            None
        );
        h.mutations.delete(EntityKind::Group, ghost).await.unwrap();
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn failed_item_delete_restores_and_view_refetches_count() {
        let h = harness();
        let c = h.mutations.create_collection("C", None).await.unwrap();
        let g = h.mutations.create_group(c.id(), "G").await.unwrap();
        let i1 = h.mutations.create_item(g.id(), "A", "").await.unwrap();
        h.mutations.create_item(g.id(), "B", "").await.unwrap();

        let key = ViewKey::new(slots::FOLDER_NOTEBOOKS).with_parent(c.id());
        let fetch = |client: Arc<dyn Backend>| {
            move |key: ViewKey| async move { client.fetch_view(&key).await }
        };
        h.views
            .load(key.clone(), fetch(Arc::clone(&h.client)))
            .await
            .unwrap();
        assert!(h.views.contains(&key));

        h.backend.fail_next(FaultOp::Delete, Some(EntityKind::Item));
        let err = h.mutations.delete(EntityKind::Item, i1.id()).await.unwrap_err();
        assert!(matches!(err, SyncError::DurableWrite { op: MutationOp::Delete, .. }));
        assert_eq!(h.store.get(EntityKind::Item, i1.id()), Some(i1.clone()));

        h.views.invalidate_entity(&i1);
        assert!(!h.views.contains(&key));
        let snapshot = h
            .views
            .load(key, fetch(Arc::clone(&h.client)))
            .await
            .unwrap()
            .into_snapshot()
            .unwrap();
        let rows: Vec<NotebookSummary> = snapshot.rows_as().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group.id, g.id());
        assert_eq!(rows[0].note_count, 2);
    }

    #[tokio::test]
    async fn successful_mutations_invalidate_affected_views() {
        let h = harness();
        let c = h.mutations.create_collection("Work", None).await.unwrap();
        let folders = ViewKey::new(slots::FOLDERS);
        let client = Arc::clone(&h.client);
        h.views
            .load(folders.clone(), move |key| async move { client.fetch_view(&key).await })
            .await
            .unwrap();
        assert!(h.views.contains(&folders));

        h.mutations.create_group(c.id(), "Physics").await.unwrap();
        assert!(!h.views.contains(&folders));
    }

    #[tokio::test]
    async fn concurrent_mutations_on_one_entity_are_last_write_wins_by_default() {
        let backend = MemoryBackend::new();
        let user = UserContext::new("alice", "alice@example.com");
        let gated = Arc::new(GatedBackend {
            inner: Arc::new(backend.connect(user.clone())),
            gate: Semaphore::new(0),
        });
        let h = harness_with(backend, gated.clone(), user, false);
        let c = h.mutations.create_collection("Work", None).await.unwrap();

        let (first, second) = tokio::join!(
            h.mutations.rename(EntityKind::Collection, c.id(), "First"),
            async {
                tokio::task::yield_now().await;
                gated.gate.add_permits(2);
                h.mutations
                    .rename(EntityKind::Collection, c.id(), "Second")
                    .await
            }
        );
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(
            h.store.get(EntityKind::Collection, c.id()),
            h.backend.dump(EntityKind::Collection).pop()
        );
    }

    #[tokio::test]
    async fn serialized_mode_rejects_second_in_flight_mutation() {
        let backend = MemoryBackend::new();
        let user = UserContext::new("alice", "alice@example.com");
        let gated = Arc::new(GatedBackend {
            inner: Arc::new(backend.connect(user.clone())),
            gate: Semaphore::new(0),
        });
        let h = harness_with(backend, gated.clone(), user, true);
        let c = h.mutations.create_collection("Work", None).await.unwrap();

        let (first, second) = tokio::join!(
            h.mutations.rename(EntityKind::Collection, c.id(), "First"),
            async {
                tokio::task::yield_now().await;
                let second = h
                    .mutations
                    .rename(EntityKind::Collection, c.id(), "Second")
                    .await;
                gated.gate.add_permits(1);
                second
            }
        );

        assert!(first.is_ok());
        match second {
            Err(SyncError::MutationInFlight { kind, id }) => {
                assert_eq!(kind, EntityKind::Collection);
                assert_eq!(id, c.id());
            }
            other => panic!("expected MutationInFlight, got {other:?}"),
        }
        let stored = h.store.get(EntityKind::Collection, c.id()).unwrap();
        assert_eq!(stored.as_collection().unwrap().name, "First");

        // Released once the first write settled.
        gated.gate.add_permits(1);
        h.mutations
            .rename(EntityKind::Collection, c.id(), "Third")
            .await
            .map(|_| ())
            .unwrap_or_else(|e| panic!("{e}"));
    }
}

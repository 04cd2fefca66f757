//! Per-login wiring of the sync layer.
//!
//! A [`SyncSession`] owns the entity store, the view cache, the mutation
//! manager and the reconciler for one signed-in user. It is built on login
//! and torn down with [`SyncSession::shutdown`] on logout; nothing survives
//! between sessions.

use crate::acl::AccessControl;
use crate::backend::{Backend, Filter};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::model::{EntityKind, UserContext};
use crate::mutation::MutationManager;
use crate::realtime::{ChangeFeed, ConnectionState, Reconciler};
use crate::seed::{seed_if_empty, SeedOutcome, SeedTemplate};
use crate::store::EntityStore;
use crate::view::{ViewCache, ViewError, ViewKey, ViewLoad};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// The collaborators a session talks to, usually one client seen through
/// three traits.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn Backend>,
    pub acl: Arc<dyn AccessControl>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: Backend + AccessControl + ChangeFeed + 'static,
    {
        Self {
            backend: client.clone(),
            acl: client.clone(),
            feed: client,
        }
    }
}

pub struct SyncSession {
    user: UserContext,
    config: SyncConfig,
    store: Arc<EntityStore>,
    views: Arc<ViewCache>,
    backend: Arc<dyn Backend>,
    acl: Arc<dyn AccessControl>,
    mutations: MutationManager,
    reconciler: Reconciler,
}

impl SyncSession {
    /// Load the user's tree, seed it on first login, then go live.
    pub async fn start(
        user: UserContext,
        config: SyncConfig,
        collaborators: Collaborators,
    ) -> SyncResult<Self> {
        let store = Arc::new(EntityStore::new());
        let views = Arc::new(ViewCache::new(config.views.ttl()));
        let mutations = MutationManager::new(
            Arc::clone(&store),
            Arc::clone(&views),
            Arc::clone(&collaborators.backend),
            user.clone(),
        )
        .serialize_same_entity(config.serialize_same_entity);
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&views),
            collaborators.feed,
            Arc::clone(&collaborators.acl),
            user.clone(),
            config.realtime.clone(),
        );
        let session = Self {
            user,
            config,
            store,
            views,
            backend: collaborators.backend,
            acl: collaborators.acl,
            mutations,
            reconciler,
        };

        session.refresh().await?;
        if session.config.seed_on_first_login {
            let template = SeedTemplate::load(session.config.seed_template.as_deref())?;
            if let SeedOutcome::Seeded(counts) =
                seed_if_empty(session.backend.as_ref(), &session.mutations, &template).await?
            {
                info!(user = %session.user.id, ?counts, "first login seeded");
            }
        }
        session.reconciler.connect();
        info!(
            user = %session.user.id,
            collections = session.store.len(EntityKind::Collection),
            groups = session.store.len(EntityKind::Group),
            items = session.store.len(EntityKind::Item),
            "sync session started"
        );
        Ok(session)
    }

    /// Replace the store contents with everything the backend lets the
    /// user read.
    pub async fn refresh(&self) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            let rows = self.backend.list(kind, &Filter::all()).await?;
            self.store.set_all(kind, rows);
        }
        Ok(())
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn views(&self) -> &Arc<ViewCache> {
        &self.views
    }

    pub fn mutations(&self) -> &MutationManager {
        &self.mutations
    }

    pub fn acl(&self) -> &Arc<dyn AccessControl> {
        &self.acl
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.reconciler.watch_state()
    }

    /// First page of `key` at the configured page size.
    pub fn first_page(&self, key: ViewKey) -> ViewKey {
        key.page(0, self.config.views.page_size)
    }

    /// The page after the `loaded` rows already shown.
    pub fn next_page(&self, key: &ViewKey, loaded: usize) -> ViewKey {
        key.clone().page(loaded, self.config.views.page_size)
    }

    /// Load a view through the cache, fetching from the backend on a miss.
    pub async fn load_view(&self, key: ViewKey) -> Result<ViewLoad, ViewError> {
        let backend = Arc::clone(&self.backend);
        self.views
            .load(key, move |key| async move { backend.fetch_view(&key).await })
            .await
    }

    /// Disconnect live sync and drop every cached entity and view.
    pub async fn shutdown(self) {
        self.reconciler.disconnect().await;
        self.store.clear_all();
        self.views.clear_all();
        info!(user = %self.user.id, "sync session closed");
    }
}

use notesync::api;
use notesync_core::acl::{AccessControl, NewInvitation};
use notesync_core::auth::{Hs256Verifier, TokenVerifier};
use notesync_core::backend::http::HttpBackend;
use notesync_core::backend::{Backend, Filter, MemoryBackend};
use notesync_core::model::{
    Collection, Entity, EntityId, EntityKind, EntityPatch, GroupPatch, PermissionLevel,
    ResourceRef, UserContext, DEFAULT_COLOR,
};
use notesync_core::view::{slots, ViewKey};
use notesync_core::BackendError;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Server {
    base: String,
    db: MemoryBackend,
    verifier: Arc<Hs256Verifier>,
    handle: JoinHandle<Result<(), std::io::Error>>,
}

impl Server {
    async fn start() -> Self {
        let db = MemoryBackend::new();
        let verifier = Arc::new(Hs256Verifier::new("test-secret".into()));
        let dyn_verifier: Arc<dyn TokenVerifier> = verifier.clone();
        let app = api::router(db.clone(), dyn_verifier);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(axum::serve(listener, app).into_future());
        Self {
            base: format!("http://{}", addr),
            db,
            verifier,
            handle,
        }
    }

    fn client(&self, name: &str) -> HttpBackend {
        HttpBackend::new(&self.base, user(name))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn user(name: &str) -> UserContext {
    UserContext::new(name, format!("{name}@example.com"))
}

fn backend_error(err: &anyhow::Error) -> &BackendError {
    BackendError::classify(err).expect("classified backend error")
}

fn candidate(owner: &str, name: &str) -> Entity {
    let now = chrono::Utc::now();
    Entity::Collection(Collection {
        id: EntityId::Temp(1),
        owner_id: owner.into(),
        name: name.into(),
        color: DEFAULT_COLOR.into(),
        created_at: now,
        updated_at: now,
    })
}

#[tokio::test]
async fn server_health_endpoint() {
    let server = Server::start().await;
    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn http_client_round_trips_rows() {
    let server = Server::start().await;
    let alice = server.client("alice");

    let folder = alice.create(&candidate("alice", "Work")).await.unwrap();
    let folder_id = folder.id().durable().unwrap();
    assert_eq!(server.db.dump(EntityKind::Collection), vec![folder.clone()]);

    let fetched = alice.get_by_id(EntityKind::Collection, folder_id).await.unwrap();
    assert_eq!(fetched, Some(folder.clone()));

    let group = alice
        .create(&Entity::Group(notesync_core::model::Group {
            id: EntityId::Temp(2),
            owner_id: "alice".into(),
            collection_id: folder.id(),
            name: "Plans".into(),
            color: DEFAULT_COLOR.into(),
            archived: false,
            archived_at: None,
            sort_order: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }))
        .await
        .unwrap();
    let renamed = alice
        .update(
            EntityKind::Group,
            group.id().durable().unwrap(),
            &EntityPatch::Group(GroupPatch {
                name: Some("Roadmap".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert!(matches!(&renamed, Entity::Group(g) if g.name == "Roadmap"));

    let listed = alice
        .list(EntityKind::Group, &Filter::all().eq("collection_id", folder.id()))
        .await
        .unwrap();
    assert_eq!(listed, vec![renamed]);

    let page = alice
        .fetch_view(&ViewKey::new(slots::FOLDER_NOTEBOOKS).with_parent(folder.id()))
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    let deleted = alice
        .delete_where(EntityKind::Group, &Filter::all().eq("collection_id", folder.id()))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    alice.delete(EntityKind::Collection, folder_id).await.unwrap();
    assert_eq!(
        alice.get_by_id(EntityKind::Collection, folder_id).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn errors_keep_their_classification() {
    let server = Server::start().await;
    let alice = server.client("alice");
    let bob = server.client("bob");
    let folder = alice.create(&candidate("alice", "Private")).await.unwrap();
    let folder_id = folder.id().durable().unwrap();

    let err = bob
        .update(
            EntityKind::Collection,
            folder_id,
            &EntityPatch::Collection(Default::default()),
        )
        .await
        .unwrap_err();
    assert!(matches!(backend_error(&err), BackendError::Forbidden(_)));

    let err = alice
        .update(
            EntityKind::Item,
            uuid::Uuid::new_v4(),
            &EntityPatch::Item(Default::default()),
        )
        .await
        .unwrap_err();
    assert!(matches!(backend_error(&err), BackendError::NotFound(_)));

    let invitation = alice
        .create_invitation(&NewInvitation {
            resource: ResourceRef::collection(folder_id),
            invitee_email: "bob@example.com".into(),
            permission_level: PermissionLevel::Read,
            expires_at: None,
            transfer_ownership_on_accept: false,
        })
        .await
        .unwrap();
    bob.accept_invitation(&invitation.token).await.unwrap();
    let err = server
        .client("carol")
        .accept_invitation(&invitation.token)
        .await
        .unwrap_err();
    assert_eq!(backend_error(&err), &BackendError::InvitationUsed);

    let level = bob
        .check_access(ResourceRef::collection(folder_id))
        .await
        .unwrap();
    assert!(level.can_read() && !level.can_write());
}

#[tokio::test]
async fn bearer_tokens_authenticate() {
    let server = Server::start().await;
    let token = server.verifier.issue(&user("dana"), None).unwrap();
    let dana = HttpBackend::new(&server.base, user("dana")).with_token(token);
    let folder = dana.create(&candidate("dana", "Mine")).await.unwrap();
    assert!(matches!(&folder, Entity::Collection(c) if c.owner_id == "dana"));

    let forged = HttpBackend::new(&server.base, user("dana")).with_token("not-a-token");
    let err = forged
        .list(EntityKind::Collection, &Filter::all())
        .await
        .unwrap_err();
    assert!(matches!(backend_error(&err), BackendError::Forbidden(_)));
}

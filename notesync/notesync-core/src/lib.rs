pub mod acl;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod mutation;
pub mod position;
pub mod projection;
pub mod quota;
pub mod realtime;
pub mod seed;
pub mod session;
pub mod store;
pub mod view;

pub use error::{BackendError, SyncError, SyncResult};
pub use session::{Collaborators, SyncSession};

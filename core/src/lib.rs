/// Offline-first synchronization core for a two-party messaging client.
///
/// Keeps a local cache of conversations consistent with a remote
/// append-mostly message store over intermittent connectivity: a typed
/// query builder compiling to the remote's filter grammar, per-
/// conversation incremental sync with backward pagination, a coordinator
/// that discovers conversations and serializes recurring sync cycles,
/// and the single-flight/async-lock primitives underneath.

pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod msg;
pub mod remote;
pub mod session;
pub mod stamp;
pub mod store;
pub mod sync;
pub mod user;

pub use chat::Chat;
pub use config::Config;
pub use context::Context;
pub use error::{Result, SyncError};
pub use manager::{ChatData, ChatManager, ChatSummary};
pub use stamp::Stamp;
pub use user::User;

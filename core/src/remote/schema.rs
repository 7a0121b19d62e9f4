/// Wire row shapes of the remote resources
use serde::{Deserialize, Serialize};

/// Row of the `messages` resource. Immutable once created; `id` is
/// server-assigned and monotonic per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub timestamp: String,
}

/// Insert shape for `messages`; id and timestamp are assigned remotely
#[derive(Debug, Clone, Serialize)]
pub struct MessageInsert {
    pub sender: String,
    pub receiver: String,
    pub body: String,
}

/// Row of the `follows` resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRow {
    pub follower: String,
    pub followee: String,
    pub timestamp: String,
}

/// Insert shape for `follows`
#[derive(Debug, Clone, Serialize)]
pub struct FollowInsert {
    pub follower: String,
    pub followee: String,
}

/// `follows` row with the joined user record projected under `joined`
#[derive(Debug, Clone, Deserialize)]
pub struct FollowWithUser {
    pub follower: String,
    pub followee: String,
    pub timestamp: String,
    pub joined: crate::user::User,
}

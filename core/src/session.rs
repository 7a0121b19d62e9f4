/// Persisted login state under the `state` key
use crate::context::Context;
use crate::error::Result;
use crate::store::keys;
use crate::user::User;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredState {
    pub login: Option<String>,
}

/// The stored state, defaulting to signed-out
pub fn stored_state(ctx: &Context) -> Result<StoredState> {
    Ok(ctx.store.get(&keys::state())?.unwrap_or_default())
}

/// Re-resolves the logged-in user at startup, if any
pub async fn restore(ctx: &Context) -> Result<Option<User>> {
    match stored_state(ctx)?.login {
        Some(id) => User::by_id(ctx, &id).await,
        None => Ok(None),
    }
}

pub fn sign_in(ctx: &Context, user: &User) -> Result<()> {
    ctx.store.set(
        &keys::state(),
        &StoredState {
            login: Some(user.id.clone()),
        },
    )
}

pub fn sign_out(ctx: &Context) -> Result<()> {
    ctx.store.remove(&keys::state())
}

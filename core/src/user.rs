/// User profiles: validated lookup with offline fallback, creation,
/// last-write-wins rename, search, and follow relations.
use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::remote::query::{Cond, Op};
use crate::remote::schema::{FollowInsert, FollowRow, FollowWithUser};
use crate::stamp::Stamp;
use crate::store::keys;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Profile record; doubles as the wire row of the `users` resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub timestamp: String,
}

/// Insert shape for `users`; the timestamp is assigned remotely
#[derive(Debug, Serialize)]
struct UserInsert<'a> {
    id: &'a str,
    name: &'a str,
}

/// Rename patch, guarded by the previous timestamp for last-write-wins
#[derive(Debug, Serialize)]
struct UserPatch<'a> {
    name: &'a str,
    timestamp: &'a str,
}

/// Locally cached follower/followed id lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowData {
    pub followers: Vec<String>,
    pub followed: Vec<String>,
}

/// Resolved follow relations of one user
#[derive(Debug, Clone, Default)]
pub struct FollowLists {
    pub followed: Vec<User>,
    pub followers: Vec<User>,
}

/// At least one character, alphanumeric or `_`
pub fn check_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// At least one character, alphanumeric or space
pub fn check_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ')
}

impl User {
    /// Finds a user by id. Queries remote and refreshes the local cache;
    /// on transport failure falls back to the cached copy. An invalid or
    /// unknown id resolves to `None`.
    pub async fn by_id(ctx: &Context, id: &str) -> Result<Option<User>> {
        if !check_valid_id(id) {
            return Ok(None);
        }

        let remote = ctx
            .remote
            .query::<User>(&ctx.config.users_url())
            .filter(Cond::cmp("id", Op::Eq, id))
            .fetch()
            .await;

        match remote {
            Ok(rows) => match rows.into_iter().next() {
                Some(user) => {
                    ctx.store.set(&keys::user(id), &user)?;
                    Ok(Some(user))
                }
                None => Ok(None),
            },
            Err(e) => {
                // Offline: serve the cached profile if we have one
                debug!("user lookup for '{}' failed, using cache: {}", id, e);
                ctx.store.get(&keys::user(id))
            }
        }
    }

    /// Creates a user. Validation errors are raised before any network
    /// call; an already-taken id resolves to `None`.
    pub async fn create(ctx: &Context, id: &str, name: &str) -> Result<Option<User>> {
        if !check_valid_id(id) {
            return Err(SyncError::Validation(format!("invalid user id '{}'", id)));
        }
        if !check_valid_name(name) {
            return Err(SyncError::Validation(format!("invalid user name '{}'", name)));
        }
        if Self::by_id(ctx, id).await?.is_some() {
            return Ok(None);
        }

        let inserted = ctx
            .remote
            .query::<User>(&ctx.config.users_url())
            .insert(&UserInsert { id, name })
            .await;
        match inserted {
            Ok(user) => {
                ctx.store.set(&keys::user(id), &user)?;
                Ok(Some(user))
            }
            // Most likely the id was taken between lookup and insert
            Err(SyncError::Transport(e)) => {
                debug!("user create for '{}' rejected: {}", id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Renames this user; last-write-wins by timestamp. `false` when a
    /// concurrent newer update won or the name is invalid.
    pub async fn rename(&mut self, ctx: &Context, name: &str) -> Result<bool> {
        if !check_valid_name(name) {
            return Ok(false);
        }
        let now = Stamp::now();
        let updated = ctx
            .remote
            .query::<User>(&ctx.config.users_url())
            .filter(Cond::cmp("id", Op::Eq, self.id.as_str()))
            .filter(Cond::cmp("timestamp", Op::Lt, now.iso()))
            .patch(&UserPatch {
                name,
                timestamp: now.iso(),
            })
            .await?;

        match updated.into_iter().next() {
            Some(user) => {
                ctx.store.set(&keys::user(&user.id), &user)?;
                *self = user;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Case-insensitive substring search over id and name
    pub async fn search(ctx: &Context, text: &str) -> Result<Vec<User>> {
        let pattern = format!("*{}*", text);
        let found = ctx
            .remote
            .query::<User>(&ctx.config.users_url())
            .filter(Cond::any(vec![
                Cond::cmp("name", Op::Ilike, pattern.clone()),
                Cond::cmp("id", Op::Ilike, pattern),
            ]))
            .fetch()
            .await?;

        for user in &found {
            ctx.store.set(&keys::user(&user.id), user)?;
        }
        Ok(found)
    }

    /// Start following another user, updating both local follow records
    pub async fn start_follow(&self, ctx: &Context, to_follow: &User) -> Result<()> {
        ctx.remote
            .query::<FollowRow>(&ctx.config.follows_url())
            .insert(&FollowInsert {
                follower: self.id.clone(),
                followee: to_follow.id.clone(),
            })
            .await?;

        let mut theirs: FollowData = ctx
            .store
            .get(&keys::follow(&to_follow.id))?
            .unwrap_or_default();
        let mut mine: FollowData = ctx.store.get(&keys::follow(&self.id))?.unwrap_or_default();
        theirs.followers.push(self.id.clone());
        mine.followed.push(to_follow.id.clone());
        ctx.store.set(&keys::follow(&to_follow.id), &theirs)?;
        ctx.store.set(&keys::follow(&self.id), &mine)?;
        Ok(())
    }

    /// Resolves who this user follows and is followed by, through the
    /// joined user projection; falls back to cached data offline.
    pub async fn follow_lists(&self, ctx: &Context) -> Result<Option<FollowLists>> {
        let followed = ctx
            .remote
            .query::<FollowRow>(&ctx.config.follows_url())
            .filter(Cond::cmp("follower", Op::Eq, self.id.as_str()))
            .join::<FollowWithUser>("followee", "joined")
            .fetch()
            .await;

        let followed = match followed {
            Ok(rows) => rows,
            Err(e) => {
                debug!("follow lookup for '{}' failed, using cache: {}", self.id, e);
                return self.follow_lists_local(ctx);
            }
        };
        let followers = ctx
            .remote
            .query::<FollowRow>(&ctx.config.follows_url())
            .filter(Cond::cmp("followee", Op::Eq, self.id.as_str()))
            .join::<FollowWithUser>("follower", "joined")
            .fetch()
            .await;
        let followers = match followers {
            Ok(rows) => rows,
            Err(e) => {
                debug!("follow lookup for '{}' failed, using cache: {}", self.id, e);
                return self.follow_lists_local(ctx);
            }
        };

        let lists = FollowLists {
            followed: followed.into_iter().map(|row| row.joined).collect(),
            followers: followers.into_iter().map(|row| row.joined).collect(),
        };
        for user in lists.followed.iter().chain(lists.followers.iter()) {
            ctx.store.set(&keys::user(&user.id), user)?;
        }

        let data = FollowData {
            followers: lists.followers.iter().map(|u| u.id.clone()).collect(),
            followed: lists.followed.iter().map(|u| u.id.clone()).collect(),
        };
        ctx.store.set(&keys::follow(&self.id), &data)?;

        Ok(Some(lists))
    }

    fn follow_lists_local(&self, ctx: &Context) -> Result<Option<FollowLists>> {
        let Some(data) = ctx.store.get::<FollowData>(&keys::follow(&self.id))? else {
            return Ok(None);
        };
        let mut lists = FollowLists::default();
        for id in &data.followed {
            if let Some(user) = ctx.store.get(&keys::user(id))? {
                lists.followed.push(user);
            }
        }
        for id in &data.followers {
            if let Some(user) = ctx.store.get(&keys::user(id))? {
                lists.followers.push(user);
            }
        }
        Ok(Some(lists))
    }
}

/// Multi-conversation sync coordinator for one local user.
///
/// Owns the summary list of all known conversations, discovers new ones
/// from a merged message feed, persists per-conversation state, and
/// publishes a recency-sorted snapshot after every change. Recurring
/// `sync` cycles are collapsed by a single-flight guard and serialized by
/// a FIFO lock so overlapping triggers (timer, pull-to-refresh, user
/// action) never interleave read-modify-persist cycles.
use crate::context::Context;
use crate::error::Result;
use crate::msg::{parse_msg, MsgData};
use crate::remote::query::{Cond, Op, Order};
use crate::remote::schema::MessageRow;
use crate::stamp::Stamp;
use crate::store::keys;
use crate::sync::{AsyncLock, SingleFlight};
use crate::user::User;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Persisted per-conversation state. Written as a whole object by both
/// the coordinator and the per-conversation sync through the same
/// `chat-data/{from}/{to}` key; last write wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatData {
    pub cached_messages: Vec<MsgData>,
    pub last_message: Option<MsgData>,
    pub draft: String,
    pub unread: bool,
}

/// Persisted coordinator meta for one local user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerMeta {
    pub user_id: String,
    pub known_chats: Vec<String>,
    pub last_sync: Stamp,
}

/// One conversation in the coordinator's summary list
#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub user: User,
    pub data: ChatData,
}

struct ManagerInner {
    meta: ManagerMeta,
    summaries: Vec<ChatSummary>,
}

#[derive(Clone)]
pub struct ChatManager {
    ctx: Context,
    pub me: User,
    inner: Arc<Mutex<ManagerInner>>,
    flight: Arc<SingleFlight<Result<()>>>,
    lock: Arc<AsyncLock>,
    tx: Arc<watch::Sender<Vec<ChatSummary>>>,
}

impl ChatManager {
    /// Loads the coordinator for a user: persisted meta, then every known
    /// counterpart's state and profile in parallel. Pairs whose profile
    /// can no longer be resolved are dropped, not fatal.
    pub async fn for_user(ctx: Context, me: User) -> Result<ChatManager> {
        let meta: ManagerMeta = ctx
            .store
            .get(&keys::chat_manager(&me.id))?
            .unwrap_or_else(|| ManagerMeta {
                user_id: me.id.clone(),
                known_chats: Vec::new(),
                last_sync: Stamp::zero(),
            });

        let loads = meta.known_chats.iter().map(|id| {
            let ctx = ctx.clone();
            let me_id = me.id.clone();
            let id = id.clone();
            async move {
                let data: ChatData = ctx
                    .store
                    .get(&keys::chat_data(&me_id, &id))
                    .ok()
                    .flatten()?;
                let user = User::by_id(&ctx, &id).await.ok().flatten()?;
                Some(ChatSummary { user, data })
            }
        });
        let mut summaries: Vec<ChatSummary> =
            join_all(loads).await.into_iter().flatten().collect();
        sort_by_recency(&mut summaries);

        let (tx, _) = watch::channel(summaries.clone());
        Ok(Self {
            ctx,
            me,
            inner: Arc::new(Mutex::new(ManagerInner { meta, summaries })),
            flight: Arc::new(SingleFlight::new()),
            lock: Arc::new(AsyncLock::new()),
            tx: Arc::new(tx),
        })
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    /// Latest-value subscription to the summary list
    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatSummary>> {
        self.tx.subscribe()
    }

    /// Snapshot of the current summary list
    pub async fn summaries(&self) -> Vec<ChatSummary> {
        self.inner.lock().await.summaries.clone()
    }

    pub async fn has_chat_with(&self, id: &str) -> bool {
        self.inner
            .lock()
            .await
            .summaries
            .iter()
            .any(|s| s.user.id == id)
    }

    /// One global sync cycle. Overlapping calls collapse into the
    /// in-flight cycle; distinct cycles queue up FIFO behind each other.
    pub async fn sync(&self) -> Result<()> {
        let this = self.clone();
        self.flight
            .run(async move {
                let _guard = this.lock.acquire().await;
                this.sync_inner().await
            })
            .await
    }

    async fn sync_inner(&self) -> Result<()> {
        debug!("sync cycle for '{}'", self.me.id);
        // Captured before the request so a message created mid-request
        // lands in the next cycle instead of being skipped
        let now = Stamp::now();
        let last_sync = self.inner.lock().await.meta.last_sync.clone();

        let rows = self
            .ctx
            .remote
            .query::<MessageRow>(&self.ctx.config.messages_url())
            .filter(Cond::any(vec![
                Cond::cmp("receiver", Op::Eq, self.me.id.as_str()),
                Cond::cmp("sender", Op::Eq, self.me.id.as_str()),
            ]))
            .filter(Cond::cmp("timestamp", Op::Gt, last_sync.iso()))
            .filter(Cond::cmp("timestamp", Op::Lte, now.iso()))
            .order("timestamp", Order::Asc)
            .fetch()
            .await?;

        if rows.is_empty() {
            debug!("nothing to sync");
            return Ok(());
        }

        // Fan the batch out to known conversations; collect unknown
        // counterparts for materialization after the loop
        let mut pending: Vec<(String, ChatData)> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();
        {
            let mut inner = self.inner.lock().await;
            for row in &rows {
                let msg = parse_msg(&self.me.id, row);
                let other_id = if row.sender == self.me.id {
                    row.receiver.clone()
                } else {
                    row.sender.clone()
                };

                if let Some(i) = inner.summaries.iter().position(|s| s.user.id == other_id) {
                    let data = &mut inner.summaries[i].data;
                    // First message for this conversation in the batch
                    // replaces the cached tail instead of growing it
                    if touched.insert(other_id) {
                        data.cached_messages = vec![msg.clone()];
                    } else {
                        data.cached_messages.push(msg.clone());
                    }
                    data.unread = data.unread || !msg.outgoing;
                    data.last_message = Some(msg);
                } else if let Some(i) = pending.iter().position(|(id, _)| *id == other_id) {
                    let data = &mut pending[i].1;
                    data.unread = data.unread || !msg.outgoing;
                    data.cached_messages.push(msg.clone());
                    data.last_message = Some(msg);
                } else {
                    let data = ChatData {
                        cached_messages: vec![msg.clone()],
                        last_message: Some(msg.clone()),
                        draft: String::new(),
                        unread: !msg.outgoing,
                    };
                    pending.push((other_id, data));
                }
            }
        }

        // Resolve each new counterpart's profile once per batch
        let profiles = join_all(
            pending
                .iter()
                .map(|(id, _)| User::by_id(&self.ctx, id)),
        )
        .await;

        let mut inner = self.inner.lock().await;
        let mut added: HashSet<String> = HashSet::new();
        for ((id, data), profile) in pending.into_iter().zip(profiles) {
            match profile {
                Ok(Some(user)) => {
                    inner.meta.known_chats.push(id.clone());
                    added.insert(id);
                    inner.summaries.push(ChatSummary { user, data });
                }
                _ => warn!("dropping conversation with unresolvable user '{}'", id),
            }
        }

        for summary in &inner.summaries {
            if touched.contains(&summary.user.id) || added.contains(&summary.user.id) {
                self.ctx.store.set(
                    &keys::chat_data(&self.me.id, &summary.user.id),
                    &summary.data,
                )?;
            }
        }

        sort_by_recency(&mut inner.summaries);
        inner.meta.last_sync = now;
        self.ctx
            .store
            .set(&keys::chat_manager(&self.me.id), &inner.meta)?;
        self.tx.send_replace(inner.summaries.clone());
        debug!("sync complete: {} new messages", rows.len());
        Ok(())
    }

    /// Takes a conversation's full state after a poll/send/draft change:
    /// registers the conversation if it is new and has a message, then
    /// re-sorts, persists and republishes.
    pub async fn update_and_save(&self, user: &User, data: ChatData) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.summaries.iter().position(|s| s.user.id == user.id) {
            Some(i) => inner.summaries[i].data = data.clone(),
            None if data.last_message.is_some() => {
                inner.meta.known_chats.push(user.id.clone());
                inner.summaries.push(ChatSummary {
                    user: user.clone(),
                    data: data.clone(),
                });
                self.ctx
                    .store
                    .set(&keys::chat_manager(&self.me.id), &inner.meta)?;
            }
            None => {}
        }
        sort_by_recency(&mut inner.summaries);
        self.ctx
            .store
            .set(&keys::chat_data(&self.me.id, &user.id), &data)?;
        self.tx.send_replace(inner.summaries.clone());
        Ok(())
    }

    /// Flips the unread flag; recency is unaffected, so no re-sort
    pub async fn mark_thread_unread(&self, user_id: &str, unread: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(i) = inner.summaries.iter().position(|s| s.user.id == user_id) {
            inner.summaries[i].data.unread = unread;
            self.ctx.store.set(
                &keys::chat_data(&self.me.id, user_id),
                &inner.summaries[i].data,
            )?;
            self.tx.send_replace(inner.summaries.clone());
        }
        Ok(())
    }
}

/// Descending by last-message stamp; conversations without a message sort
/// last, keeping their relative order (stable sort).
fn sort_by_recency(summaries: &mut [ChatSummary]) {
    summaries.sort_by_key(|s| {
        Reverse(
            s.data
                .last_message
                .as_ref()
                .map(|m| m.stamp.unix())
                .unwrap_or(i64::MIN),
        )
    });
}

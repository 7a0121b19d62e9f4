/// Per-conversation sync: one message window between the local user and
/// one counterpart.
///
/// The loaded window is always ascending by stamp. Everything below the
/// contiguous boundary is known-complete; above it, messages are
/// provisional until the next tail sync replaces that suffix wholesale
/// with the server-confirmed tail. Backward pagination prepends below the
/// boundary. Each operation holds the instance state lock for its whole
/// body, so prepend and append reconciliation never interleave.
use crate::context::Context;
use crate::error::Result;
use crate::manager::{ChatData, ChatManager};
use crate::msg::{parse_msg, MsgBody, MsgData};
use crate::remote::query::{Cond, Op, Order, Query};
use crate::remote::schema::{MessageInsert, MessageRow};
use crate::stamp::Stamp;
use crate::sync::SingleFlight;
use crate::user::User;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::warn;

struct ChatInner {
    /// Loaded window, ascending by stamp
    msgs: Vec<MsgData>,
    /// Tail checkpoint: stamp of the newest server-confirmed message
    last_sync_time: Stamp,
    /// Contiguous boundary: prefix length of `msgs` that is confirmed
    synced_len: usize,
    /// Persisted conversation state, shared with the coordinator
    data: ChatData,
}

#[derive(Clone)]
pub struct Chat {
    ctx: Context,
    manager: ChatManager,
    pub me: User,
    pub other: User,
    /// Base query for messages between the two participants
    msg_query: Query<MessageRow>,
    inner: Arc<Mutex<ChatInner>>,
    poll_flight: Arc<SingleFlight<Result<()>>>,
    history_flight: Arc<SingleFlight<Result<bool>>>,
    tx: Arc<watch::Sender<Vec<MsgData>>>,
}

impl Chat {
    /// Number of messages to fetch at a time
    pub const CHUNK_SIZE: usize = 30;

    /// Builds the conversation from its cached seed and kicks off a
    /// best-effort tail sync in the background.
    pub fn new(manager: &ChatManager, me: User, other: User, seed: Option<ChatData>) -> Chat {
        let ctx = manager.context().clone();
        let data = seed.unwrap_or_default();

        let msg_query = ctx
            .remote
            .query::<MessageRow>(&ctx.config.messages_url())
            .filter(Cond::any(vec![
                Cond::all(vec![
                    Cond::cmp("receiver", Op::Eq, other.id.as_str()),
                    Cond::cmp("sender", Op::Eq, me.id.as_str()),
                ]),
                Cond::all(vec![
                    Cond::cmp("receiver", Op::Eq, me.id.as_str()),
                    Cond::cmp("sender", Op::Eq, other.id.as_str()),
                ]),
            ]));

        let msgs = data.cached_messages.clone();
        let (tx, _) = watch::channel(msgs.clone());
        let chat = Self {
            ctx,
            manager: manager.clone(),
            me,
            other,
            msg_query,
            inner: Arc::new(Mutex::new(ChatInner {
                msgs,
                last_sync_time: Stamp::zero(),
                synced_len: 0,
                data,
            })),
            poll_flight: Arc::new(SingleFlight::new()),
            history_flight: Arc::new(SingleFlight::new()),
            tx: Arc::new(tx),
        };

        // Warm-up tail sync; failures are logged, not surfaced
        let warmup = chat.clone();
        tokio::spawn(async move {
            if let Err(e) = warmup.poll(true).await {
                warn!("initial poll for chat with '{}' failed: {}", warmup.other.id, e);
            }
        });
        chat
    }

    /// Latest-value subscription to the loaded window
    pub fn subscribe(&self) -> watch::Receiver<Vec<MsgData>> {
        self.tx.subscribe()
    }

    /// Snapshot of the loaded window
    pub async fn messages(&self) -> Vec<MsgData> {
        self.inner.lock().await.msgs.clone()
    }

    /// Snapshot of the persisted conversation state
    pub async fn data(&self) -> ChatData {
        self.inner.lock().await.data.clone()
    }

    /// Loads up to `CHUNK_SIZE` messages older than the oldest loaded
    /// one and prepends them. Returns `true` when there may be more.
    /// Overlapping calls collapse into the in-flight fetch.
    pub async fn poll_history(&self) -> Result<bool> {
        let this = self.clone();
        self.history_flight
            .run(async move { this.poll_history_inner().await })
            .await
    }

    async fn poll_history_inner(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        // Without a first message there is nothing to paginate from
        let before = match inner.msgs.first() {
            Some(oldest) => oldest.stamp.iso().to_string(),
            None => return Ok(false),
        };

        let rows = self
            .msg_query
            .clone()
            .filter(Cond::cmp("timestamp", Op::Lt, before))
            .limit(Self::CHUNK_SIZE)
            .order("timestamp", Order::Desc)
            .fetch()
            .await?;
        let older: Vec<MsgData> = rows.iter().rev().map(|r| parse_msg(&self.me.id, r)).collect();

        let fetched = older.len();
        inner.msgs.splice(0..0, older);
        inner.synced_len += fetched;
        self.tx.send_replace(inner.msgs.clone());

        // A full chunk implies more may exist
        Ok(fetched == Self::CHUNK_SIZE)
    }

    /// Tail sync: fetches messages newer than the checkpoint (all of
    /// them, or the newest `CHUNK_SIZE` when `reset` discards the loaded
    /// window), replaces the provisional suffix with the confirmed tail
    /// and persists through the coordinator. Overlapping calls collapse
    /// into the in-flight fetch.
    pub async fn poll(&self, reset: bool) -> Result<()> {
        let this = self.clone();
        self.poll_flight
            .run(async move { this.poll_inner(reset).await })
            .await
    }

    async fn poll_inner(&self, reset: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let rows = self
            .msg_query
            .clone()
            .filter(Cond::cmp("timestamp", Op::Gt, inner.last_sync_time.iso()))
            .limit_if(reset, Self::CHUNK_SIZE)
            .order("timestamp", Order::Desc)
            .fetch()
            .await?;
        // Discard the old window only once the replacement fetch has
        // succeeded; a failed refresh keeps the previous state
        if reset {
            inner.msgs.clear();
            inner.synced_len = 0;
        }
        let new_msgs: Vec<MsgData> = rows.iter().rev().map(|r| parse_msg(&self.me.id, r)).collect();

        if let Some(latest) = new_msgs.last() {
            inner.last_sync_time = latest.stamp.clone();
            inner.data.last_message = Some(latest.clone());
        }

        // The confirmed tail supersedes the provisional suffix (which
        // includes any already-confirmed local sends); splicing instead
        // of appending is what keeps ids unique.
        let boundary = inner.synced_len;
        inner.msgs.truncate(boundary);
        inner.msgs.extend(new_msgs);
        inner.synced_len = inner.msgs.len();
        self.tx.send_replace(inner.msgs.clone());

        let data = inner.data.clone();
        drop(inner);

        // Persist even when nothing new arrived, so listeners observe
        // concurrent draft/read-state changes
        self.manager.update_and_save(&self.other, data).await
    }

    /// Sends a message and appends the server-confirmed copy to the
    /// window. The insert is awaited, so no placeholder with a temporary
    /// id ever exists; failures propagate and leave no partial state.
    pub async fn send(&self, body: MsgBody) -> Result<()> {
        let row = self
            .ctx
            .remote
            .query::<MessageRow>(&self.ctx.config.messages_url())
            .insert(&MessageInsert {
                sender: self.me.id.clone(),
                receiver: self.other.id.clone(),
                body: body.to_wire(),
            })
            .await?;

        let msg = MsgData {
            id: row.id,
            outgoing: true,
            body,
            stamp: Stamp::from_iso(&row.timestamp),
        };

        let data = {
            let mut inner = self.inner.lock().await;
            inner.msgs.push(msg.clone());
            inner.data.last_message = Some(msg);
            self.tx.send_replace(inner.msgs.clone());
            inner.data.clone()
        };
        self.manager.update_and_save(&self.other, data).await
    }

    /// Updates and persists the draft; no network call
    pub async fn set_draft(&self, draft: &str) -> Result<()> {
        let data = {
            let mut inner = self.inner.lock().await;
            inner.data.draft = draft.to_string();
            inner.data.clone()
        };
        self.manager.update_and_save(&self.other, data).await
    }
}

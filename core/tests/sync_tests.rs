/// End-to-end sync scenarios over a scripted transport
use async_trait::async_trait;
use chatlink_core::manager::ManagerMeta;
use chatlink_core::msg::{MsgBody, MsgPart};
use chatlink_core::remote::Transport;
use chatlink_core::store::keys;
use chatlink_core::{Chat, ChatData, ChatManager, Config, Context, Result, SyncError, User};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Scripted remote: a user table served by id, FIFO message pages for
/// anything hitting the messages resource, FIFO insert echoes, and a
/// request log.
struct MockRemote {
    users: Mutex<HashMap<String, Value>>,
    message_pages: Mutex<VecDeque<Value>>,
    insert_replies: Mutex<VecDeque<Value>>,
    get_log: Mutex<Vec<String>>,
    post_log: Mutex<Vec<(String, Value)>>,
    fail_next_fetch: Mutex<bool>,
    delay: Duration,
}

impl MockRemote {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            message_pages: Mutex::new(VecDeque::new()),
            insert_replies: Mutex::new(VecDeque::new()),
            get_log: Mutex::new(Vec::new()),
            post_log: Mutex::new(Vec::new()),
            fail_next_fetch: Mutex::new(false),
            delay,
        })
    }

    fn add_user(&self, id: &str) {
        self.users.lock().unwrap().insert(
            id.to_string(),
            json!({"id": id, "name": id, "timestamp": "2021-01-01T00:00:00"}),
        );
    }

    fn queue_message_page(&self, page: Value) {
        self.message_pages.lock().unwrap().push_back(page);
    }

    fn queue_insert_reply(&self, row: Value) {
        self.insert_replies.lock().unwrap().push_back(row);
    }

    /// The next message fetch fails as if the network dropped
    fn fail_next_message_fetch(&self) {
        *self.fail_next_fetch.lock().unwrap() = true;
    }

    fn message_fetches(&self) -> usize {
        self.get_log
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains("/messages?"))
            .count()
    }

    fn sent_bodies(&self) -> Vec<Value> {
        self.post_log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockRemote {
    async fn get(&self, url: &str) -> Result<Value> {
        self.get_log.lock().unwrap().push(url.to_string());
        tokio::time::sleep(self.delay).await;
        if url.contains("/users?") {
            let id = url
                .split("id=eq.")
                .nth(1)
                .and_then(|rest| rest.split('&').next())
                .unwrap_or("");
            let users = self.users.lock().unwrap();
            return Ok(match users.get(id) {
                Some(user) => json!([user.clone()]),
                None => json!([]),
            });
        }
        if std::mem::take(&mut *self.fail_next_fetch.lock().unwrap()) {
            return Err(SyncError::Transport("scripted outage".to_string()));
        }
        Ok(self
            .message_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| json!([])))
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        self.post_log
            .lock()
            .unwrap()
            .push((url.to_string(), body));
        tokio::time::sleep(self.delay).await;
        Ok(self
            .insert_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| json!([])))
    }

    async fn patch(&self, _url: &str, _body: Value) -> Result<Value> {
        Ok(json!([]))
    }

    async fn delete(&self, _url: &str) -> Result<Value> {
        Ok(json!([]))
    }
}

fn test_context(remote: Arc<MockRemote>) -> (Context, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        base_url: "http://remote/api".to_string(),
        bearer_token: String::new(),
        data_dir: dir.path().to_path_buf(),
    };
    (Context::with_transport(config, remote).unwrap(), dir)
}

fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        name: id.to_string(),
        timestamp: String::new(),
    }
}

fn msg_row(id: i64, sender: &str, receiver: &str, body: &str, timestamp: &str) -> Value {
    json!({
        "id": id,
        "sender": sender,
        "receiver": receiver,
        "body": body,
        "timestamp": timestamp,
    })
}

/// Seconds after 09:00 on a fixed day, as a wire timestamp
fn ts(seconds: u32) -> String {
    format!("2021-04-13T09:{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Lets the constructor's background warm-up poll settle
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_poll_exposes_ascending_window_and_last_message() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    // Server answers newest-first; the window must come out ascending
    remote.queue_message_page(json!([
        msg_row(2, "alice", "bob", "and you?", &ts(300)),
        msg_row(1, "bob", "alice", "hi", &ts(0)),
    ]));
    chat.poll(true).await.unwrap();

    let msgs = chat.messages().await;
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].id, 1);
    assert_eq!(msgs[1].id, 2);
    assert!(msgs[0].stamp.unix() < msgs[1].stamp.unix());

    let data = chat.data().await;
    assert_eq!(data.last_message.as_ref().unwrap().id, 2);

    // The coordinator registered the conversation and persisted its state
    let summaries = manager.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].user.id, "bob");
    let stored: Option<ChatData> = ctx.store.get(&keys::chat_data("alice", "bob")).unwrap();
    assert_eq!(stored.unwrap().last_message.unwrap().id, 2);
    let meta: Option<ManagerMeta> = ctx.store.get(&keys::chat_manager("alice")).unwrap();
    assert_eq!(meta.unwrap().known_chats, vec!["bob".to_string()]);
}

#[tokio::test]
async fn test_send_then_poll_does_not_duplicate() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    remote.queue_insert_reply(json!([msg_row(5, "alice", "bob", "hello", &ts(10))]));
    chat.send(MsgBody::Text("hello".to_string())).await.unwrap();
    assert_eq!(chat.messages().await.len(), 1);

    // The confirmed copy comes back in the next tail sync
    remote.queue_message_page(json!([msg_row(5, "alice", "bob", "hello", &ts(10))]));
    chat.poll(false).await.unwrap();

    let msgs = chat.messages().await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].id, 5);
    assert!(msgs[0].outgoing);
}

#[tokio::test]
async fn test_poll_history_pagination() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    // Nothing loaded yet: nothing to paginate from, and no request made
    let fetches = remote.message_fetches();
    assert!(!chat.poll_history().await.unwrap());
    assert_eq!(remote.message_fetches(), fetches);

    remote.queue_message_page(json!([msg_row(100, "bob", "alice", "newest", &ts(200))]));
    chat.poll(true).await.unwrap();

    // A full chunk of older messages, newest-first
    let full_page: Vec<Value> = (0..Chat::CHUNK_SIZE as i64)
        .map(|i| {
            let id = 99 - i;
            msg_row(id, "bob", "alice", "old", &ts(100 + id as u32))
        })
        .collect();
    remote.queue_message_page(Value::Array(full_page));
    assert!(chat.poll_history().await.unwrap());

    let msgs = chat.messages().await;
    assert_eq!(msgs.len(), Chat::CHUNK_SIZE + 1);
    assert_eq!(msgs.first().unwrap().id, 70);
    assert_eq!(msgs.last().unwrap().id, 100);
    let sorted = msgs.windows(2).all(|w| w[0].stamp.unix() <= w[1].stamp.unix());
    assert!(sorted);

    // A short (empty) page means the history is exhausted
    assert!(!chat.poll_history().await.unwrap());
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_window() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    remote.queue_message_page(json!([msg_row(1, "bob", "alice", "hi", &ts(10))]));
    chat.poll(true).await.unwrap();
    assert_eq!(chat.messages().await.len(), 1);

    // A refresh that dies on the wire must not blank the window
    remote.fail_next_message_fetch();
    assert!(chat.poll(true).await.is_err());

    let msgs = chat.messages().await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].id, 1);
    assert_eq!(chat.data().await.last_message.unwrap().id, 1);
}

#[tokio::test]
async fn test_first_sync_discovers_new_conversation_unread() {
    let remote = MockRemote::new();
    remote.add_user("carol");
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    remote.queue_message_page(json!([msg_row(1, "carol", "alice", "hey", &ts(30))]));
    manager.sync().await.unwrap();

    let summaries = manager.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].user.id, "carol");
    assert!(summaries[0].data.unread);
    assert_eq!(summaries[0].data.last_message.as_ref().unwrap().id, 1);

    let meta: ManagerMeta = ctx
        .store
        .get(&keys::chat_manager("alice"))
        .unwrap()
        .unwrap();
    assert_eq!(meta.known_chats, vec!["carol".to_string()]);
    assert!(meta.last_sync.unix() > 0);

    let stored: Option<ChatData> = ctx.store.get(&keys::chat_data("alice", "carol")).unwrap();
    assert!(stored.unwrap().unread);
}

#[tokio::test]
async fn test_sync_drops_unresolvable_counterpart() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    // "ghost" is not in the user table
    remote.queue_message_page(json!([msg_row(1, "ghost", "alice", "boo", &ts(30))]));
    manager.sync().await.unwrap();

    assert!(manager.summaries().await.is_empty());
    // The cycle itself still completed and advanced the checkpoint
    let meta: ManagerMeta = ctx
        .store
        .get(&keys::chat_manager("alice"))
        .unwrap()
        .unwrap();
    assert!(meta.last_sync.unix() > 0);
}

#[tokio::test]
async fn test_sync_with_nothing_new_advances_no_state() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    manager.sync().await.unwrap();

    let meta: Option<ManagerMeta> = ctx.store.get(&keys::chat_manager("alice")).unwrap();
    assert!(meta.is_none());
    assert!(manager.summaries().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_syncs_collapse_to_one_fetch() {
    let remote = MockRemote::with_delay(Duration::from_millis(50));
    remote.add_user("carol");
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();

    remote.queue_message_page(json!([msg_row(1, "carol", "alice", "hey", &ts(30))]));

    let m1 = manager.clone();
    let m2 = manager.clone();
    let (a, b) = tokio::join!(m1.sync(), m2.sync());
    a.unwrap();
    b.unwrap();

    assert_eq!(remote.message_fetches(), 1);
    let summaries = manager.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].user.id, "carol");
}

#[tokio::test]
async fn test_existing_conversation_updates_tail_and_unread() {
    let remote = MockRemote::new();
    remote.add_user("bob");
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    // First cycle: bob becomes known
    remote.queue_message_page(json!([msg_row(1, "alice", "bob", "ping", &ts(10))]));
    manager.sync().await.unwrap();
    let summaries = manager.summaries().await;
    assert_eq!(summaries.len(), 1);
    // Only our own outgoing message: not unread
    assert!(!summaries[0].data.unread);

    // Second cycle: two incoming messages; the cached tail buffer is
    // replaced on first touch, then appended to
    remote.queue_message_page(json!([
        msg_row(2, "bob", "alice", "pong", &ts(20)),
        msg_row(3, "bob", "alice", "pong again", &ts(30)),
    ]));
    manager.sync().await.unwrap();

    let summaries = manager.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].data.unread);
    let cached_ids: Vec<i64> = summaries[0]
        .data
        .cached_messages
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(cached_ids, vec![2, 3]);
    assert_eq!(summaries[0].data.last_message.as_ref().unwrap().id, 3);
}

#[tokio::test]
async fn test_for_user_restores_persisted_conversations() {
    let remote = MockRemote::new();
    remote.add_user("bob");
    let (ctx, _dir) = test_context(remote.clone());

    // A previous run knew bob and a ghost whose profile no longer resolves
    {
        let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();
        remote.queue_message_page(json!([
            msg_row(1, "bob", "alice", "hi", &ts(10)),
        ]));
        manager.sync().await.unwrap();
        let mut meta: ManagerMeta = ctx
            .store
            .get(&keys::chat_manager("alice"))
            .unwrap()
            .unwrap();
        meta.known_chats.push("ghost".to_string());
        ctx.store.set(&keys::chat_manager("alice"), &meta).unwrap();
        ctx.store
            .set(&keys::chat_data("alice", "ghost"), &ChatData::default())
            .unwrap();
    }

    let restored = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();
    let summaries = restored.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].user.id, "bob");
    assert_eq!(summaries[0].data.last_message.as_ref().unwrap().id, 1);
}

#[tokio::test]
async fn test_send_escapes_marker_on_the_wire() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    remote.queue_insert_reply(json!([msg_row(9, "alice", "bob", "@@hello", &ts(5))]));
    chat.send(MsgBody::Text("@hello".to_string())).await.unwrap();

    let bodies = remote.sent_bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["body"], "@@hello");
    // The local window keeps the unescaped text
    let msgs = chat.messages().await;
    assert_eq!(
        msgs[0].body,
        MsgBody::Text("@hello".to_string())
    );
}

#[tokio::test]
async fn test_send_structured_parts_carries_marker() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx, user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    remote.queue_insert_reply(json!([msg_row(3, "alice", "bob", "@[]", &ts(5))]));
    chat.send(MsgBody::Parts(vec![MsgPart::Url {
        body: "http://example.org".to_string(),
    }]))
    .await
    .unwrap();

    let bodies = remote.sent_bodies();
    let wire = bodies[0]["body"].as_str().unwrap();
    assert!(wire.starts_with("@["));
    assert!(wire.contains("\"URL\""));
}

#[tokio::test]
async fn test_draft_is_persisted_without_network() {
    let remote = MockRemote::new();
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();
    let chat = Chat::new(&manager, user("alice"), user("bob"), None);
    settle().await;

    let fetches = remote.message_fetches();
    chat.set_draft("half-written thought").await.unwrap();
    assert_eq!(remote.message_fetches(), fetches);

    let stored: ChatData = ctx
        .store
        .get(&keys::chat_data("alice", "bob"))
        .unwrap()
        .unwrap();
    assert_eq!(stored.draft, "half-written thought");
}

#[tokio::test]
async fn test_mark_thread_unread_round_trip() {
    let remote = MockRemote::new();
    remote.add_user("bob");
    let (ctx, _dir) = test_context(remote.clone());
    let manager = ChatManager::for_user(ctx.clone(), user("alice")).await.unwrap();

    remote.queue_message_page(json!([msg_row(1, "bob", "alice", "hi", &ts(10))]));
    manager.sync().await.unwrap();
    assert!(manager.summaries().await[0].data.unread);

    manager.mark_thread_unread("bob", false).await.unwrap();
    assert!(!manager.summaries().await[0].data.unread);
    let stored: ChatData = ctx
        .store
        .get(&keys::chat_data("alice", "bob"))
        .unwrap()
        .unwrap();
    assert!(!stored.unread);
}

#[tokio::test]
async fn test_session_sign_in_restore_sign_out() {
    let remote = MockRemote::new();
    remote.add_user("alice");
    let (ctx, _dir) = test_context(remote.clone());

    assert!(chatlink_core::session::restore(&ctx).await.unwrap().is_none());

    chatlink_core::session::sign_in(&ctx, &user("alice")).unwrap();
    let restored = chatlink_core::session::restore(&ctx).await.unwrap();
    assert_eq!(restored.unwrap().id, "alice");

    chatlink_core::session::sign_out(&ctx).unwrap();
    assert!(chatlink_core::session::restore(&ctx).await.unwrap().is_none());
}

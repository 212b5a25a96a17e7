/// Integration tests: drive the chat service against an in-memory store and
/// watch what each user's room receives.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use tandem_db::Database;
use tandem_gateway::chat::ChatService;
use tandem_gateway::dispatcher::Dispatcher;
use tandem_gateway::error::ChatError;
use tandem_types::events::{ErrorKind, MessagePayload, NewMessage, ServerEvent};
use tandem_types::models::Message;

struct Harness {
    db: Arc<Database>,
    chat: ChatService,
}

impl Harness {
    fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = ChatService::new(db.clone(), Dispatcher::new());
        Self { db, chat }
    }

    fn user(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .create_user(id, name, &format!("{name}@example.com"), "hash", None)
            .unwrap();
        id
    }

    async fn connect(&self, user: Uuid) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        self.chat.dispatcher().connect(user).await
    }
}

fn text(sender: Uuid, receiver: Uuid, body: &str) -> NewMessage {
    NewMessage {
        sender,
        receiver,
        text: Some(body.to_string()),
        image_url: None,
        video_url: None,
        msg_by_user_id: sender,
    }
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn pushed_message(events: &[ServerEvent]) -> Option<&Message> {
    events.iter().find_map(|e| match e {
        ServerEvent::Message(MessagePayload::New(m)) => Some(m),
        _ => None,
    })
}

fn read_receipt(events: &[ServerEvent]) -> Option<&Vec<Message>> {
    events.iter().find_map(|e| match e {
        ServerEvent::MessageRead(list) => Some(list),
        _ => None,
    })
}

#[tokio::test]
async fn first_message_creates_conversation_and_reaches_both_rooms() {
    let h = Harness::new();
    let (u1, u2) = (h.user("u1"), h.user("u2"));
    let (_c1, mut rx1) = h.connect(u1).await;
    let (_c2, mut rx2) = h.connect(u2).await;

    let sent = h.chat.send(u1, text(u1, u2, "hi")).await.unwrap();

    assert_eq!(h.db.count_conversations().unwrap(), 1);
    let conversation = h.db.find_conversation(u1, u2).unwrap().unwrap();
    assert_eq!(sent.conversation_id, conversation.id);
    assert!(!sent.seen);
    assert!(!sent.delivered);
    assert_eq!(sent.text.as_deref(), Some("hi"));

    assert_eq!(pushed_message(&drain(&mut rx1)), Some(&sent));
    assert_eq!(pushed_message(&drain(&mut rx2)), Some(&sent));
}

#[tokio::test]
async fn offline_receiver_does_not_fail_send() {
    let h = Harness::new();
    let (u1, u2) = (h.user("u1"), h.user("u2"));
    let (_c1, mut rx1) = h.connect(u1).await;

    let sent = h.chat.send(u1, text(u1, u2, "are you there?")).await.unwrap();
    assert_eq!(pushed_message(&drain(&mut rx1)), Some(&sent));

    // Picked up from history once u2 comes back.
    let history = h.chat.history(u2, u1).await.unwrap();
    assert_eq!(history.messages, vec![sent]);
}

#[tokio::test]
async fn resolve_is_order_independent() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));

    let ab = h.chat.resolve(a, b).await.unwrap();
    let ba = h.chat.resolve(b, a).await.unwrap();
    assert_eq!(ab.id, ba.id);
    assert_eq!(h.db.count_conversations().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_messages_share_one_conversation() {
    for _ in 0..20 {
        let h = Harness::new();
        let (a, b) = (h.user("a"), h.user("b"));

        let (chat_a, chat_b) = (h.chat.clone(), h.chat.clone());
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { chat_a.send(a, text(a, b, "from a")).await }),
            tokio::spawn(async move { chat_b.send(b, text(b, a, "from b")).await }),
        );
        let (ma, mb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());

        assert_eq!(h.db.count_conversations().unwrap(), 1);
        assert_eq!(ma.conversation_id, mb.conversation_id);
        assert_eq!(h.chat.history(a, b).await.unwrap().messages.len(), 2);
    }
}

#[tokio::test]
async fn history_is_identical_from_both_sides() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));

    let m1 = h.chat.send(a, text(a, b, "one")).await.unwrap();
    let m2 = h.chat.send(b, text(b, a, "two")).await.unwrap();
    let m3 = h.chat.send(a, text(a, b, "three")).await.unwrap();

    let from_a = h.chat.history(a, b).await.unwrap();
    let from_b = h.chat.history(b, a).await.unwrap();
    assert_eq!(from_a.messages, vec![m1, m2, m3]);
    assert_eq!(from_a.messages, from_b.messages);
    assert_eq!(from_a.peer.id, b);
    assert_eq!(from_b.peer.id, a);
}

#[tokio::test]
async fn message_page_without_history_emits_empty_list() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    let (conn_a, mut rx_a) = h.connect(a).await;
    let (_conn_b, _rx_b) = h.connect(b).await;

    h.chat.open_page(a, conn_a, b).await.unwrap();

    let events = drain(&mut rx_a);
    assert_eq!(events.len(), 2);
    match &events[0] {
        ServerEvent::MessageUser(peer) => {
            assert_eq!(peer.id, b);
            assert_eq!(peer.name, "b");
            assert!(peer.online);
        }
        other => panic!("expected message-user, got {:?}", other),
    }
    match &events[1] {
        ServerEvent::Message(MessagePayload::History(list)) => assert!(list.is_empty()),
        other => panic!("expected empty history, got {:?}", other),
    }

    // Looking does not create a conversation.
    assert_eq!(h.db.count_conversations().unwrap(), 0);
}

#[tokio::test]
async fn message_page_reports_offline_peer() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));

    let history = h.chat.history(a, b).await.unwrap();
    assert!(!history.peer.online);

    let unknown = h.chat.history(a, Uuid::new_v4()).await;
    assert!(matches!(unknown, Err(ChatError::Validation(_))));
}

#[tokio::test]
async fn seen_flips_counterparty_messages_and_notifies_both() {
    let h = Harness::new();
    let (u1, u2) = (h.user("u1"), h.user("u2"));
    let (_c1, mut rx1) = h.connect(u1).await;
    let (_c2, mut rx2) = h.connect(u2).await;

    h.chat.send(u1, text(u1, u2, "hi")).await.unwrap();
    h.chat.send(u1, text(u1, u2, "you there?")).await.unwrap();
    h.chat.send(u2, text(u2, u1, "yes")).await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    h.chat.mark_seen(u2, u1).await.unwrap();

    let (events1, events2) = (drain(&mut rx1), drain(&mut rx2));
    let read1 = read_receipt(&events1).expect("u1 gets message-read");
    let read2 = read_receipt(&events2).expect("u2 gets message-read");
    assert_eq!(read1, read2);
    assert_eq!(read1.len(), 3);
    for m in read1 {
        assert_eq!(m.seen, m.msg_by_user_id == u1);
    }

    // Sidebars follow the receipts so unread badges clear.
    let sidebar2 = events2.iter().find_map(|e| match e {
        ServerEvent::Conversation(list) => Some(list),
        _ => None,
    });
    assert_eq!(sidebar2.expect("u2 gets sidebar")[0].unseen_count, 0);
    let sidebar1 = events1.iter().find_map(|e| match e {
        ServerEvent::Conversation(list) => Some(list),
        _ => None,
    });
    assert_eq!(sidebar1.expect("u1 gets sidebar")[0].unseen_count, 1);

    // message-read goes out before the sidebar.
    assert!(matches!(events1[0], ServerEvent::MessageRead(_)));
}

#[tokio::test]
async fn seen_is_idempotent() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    h.chat.send(a, text(a, b, "hi")).await.unwrap();
    h.chat.send(b, text(b, a, "hey")).await.unwrap();

    h.chat.mark_seen(b, a).await.unwrap();
    let once = h.chat.history(a, b).await.unwrap().messages;
    h.chat.mark_seen(b, a).await.unwrap();
    let twice = h.chat.history(a, b).await.unwrap().messages;

    assert_eq!(once, twice);
}

#[tokio::test]
async fn seen_without_conversation_still_answers_both_sides() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    let (_ca, mut rx_a) = h.connect(a).await;
    let (_cb, mut rx_b) = h.connect(b).await;

    h.chat.mark_seen(a, b).await.unwrap();

    for events in [drain(&mut rx_a), drain(&mut rx_b)] {
        assert_eq!(events.len(), 2);
        assert_eq!(read_receipt(&events).map(Vec::len), Some(0));
        assert!(matches!(&events[1], ServerEvent::Conversation(list) if list.is_empty()));
    }
    assert_eq!(h.db.count_conversations().unwrap(), 0);
}

#[tokio::test]
async fn empty_message_is_rejected_before_persistence() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    let (_ca, mut rx_a) = h.connect(a).await;

    let mut empty = text(a, b, "");
    empty.text = None;
    let result = h.chat.send(a, empty).await;

    assert!(matches!(result, Err(ChatError::Validation(_))));
    assert_eq!(h.db.count_conversations().unwrap(), 0);
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn media_only_message_is_accepted() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));

    let mut photo = text(a, b, "");
    photo.text = None;
    photo.image_url = Some("https://cdn.example.com/p.png".to_string());

    let sent = h.chat.send(a, photo).await.unwrap();
    assert!(sent.text.is_none());
    assert_eq!(sent.image_url.as_deref(), Some("https://cdn.example.com/p.png"));
}

#[tokio::test]
async fn forged_sender_is_rejected() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));

    let result = h.chat.send(b, text(a, b, "not me")).await;
    assert!(matches!(result, Err(ChatError::Validation(_))));

    let unknown = h.chat.send(a, text(a, Uuid::new_v4(), "hello?")).await;
    assert!(matches!(unknown, Err(ChatError::Validation(_))));
    assert_eq!(h.db.count_conversations().unwrap(), 0);
}

#[tokio::test]
async fn store_failure_emits_nothing() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    let (_ca, mut rx_a) = h.connect(a).await;
    let (_cb, mut rx_b) = h.connect(b).await;

    h.db
        .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE conversation_messages")?))
        .unwrap();

    let err = h.chat.send(a, text(a, b, "lost")).await.unwrap_err();
    assert!(matches!(err, ChatError::Store(_)));
    match err.to_event("new message") {
        ServerEvent::Error { event, kind, .. } => {
            assert_eq!(event, "new message");
            assert_eq!(kind, ErrorKind::StoreUnavailable);
        }
        other => panic!("expected error event, got {:?}", other),
    }

    assert!(pushed_message(&drain(&mut rx_a)).is_none());
    assert!(pushed_message(&drain(&mut rx_b)).is_none());
}

#[tokio::test]
async fn sidebar_is_only_served_to_its_owner() {
    let h = Harness::new();
    let (a, b) = (h.user("a"), h.user("b"));
    let (conn_a, mut rx_a) = h.connect(a).await;
    h.chat.send(b, text(b, a, "hello")).await.unwrap();
    drain(&mut rx_a);

    h.chat.refresh_sidebar(a, conn_a, a).await.unwrap();
    let events = drain(&mut rx_a);
    match &events[..] {
        [ServerEvent::Conversation(list)] => {
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].peer.id, b);
            assert_eq!(list[0].unseen_count, 1);
        }
        other => panic!("expected one conversation event, got {:?}", other),
    }

    let result = h.chat.refresh_sidebar(a, conn_a, b).await;
    assert!(matches!(result, Err(ChatError::Validation(_))));
}

#[tokio::test]
async fn presence_follows_connection_count() {
    let h = Harness::new();
    let dispatcher = h.chat.dispatcher();
    let user = h.user("multi");

    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(dispatcher.connect(user).await);
    }
    for (conn_id, _) in conns.drain(..2) {
        dispatcher.disconnect(user, conn_id).await;
    }
    assert!(dispatcher.is_online(user).await);

    let (last, _rx) = conns.pop().unwrap();
    dispatcher.disconnect(user, last).await;
    assert!(!dispatcher.is_online(user).await);
}

//! Conversation resolution, the message pipeline and read receipts.
//!
//! Every operation finishes its store writes before it emits anything, so a
//! client that receives an event can re-read a consistent store.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use tandem_db::Database;
use tandem_db::models::NewMessageRow;
use tandem_types::events::{MessagePayload, NewMessage, ServerEvent};
use tandem_types::models::{Conversation, ConversationSummary, Message, PeerHeader};

use crate::dispatcher::Dispatcher;
use crate::error::ChatError;

/// Longest accepted message text, in characters.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Conversation history together with the peer it belongs to.
#[derive(Debug, Clone)]
pub struct History {
    pub peer: PeerHeader,
    pub messages: Vec<Message>,
}

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl ChatService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run a blocking store call off the async runtime.
    async fn store<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Store(e.into())
            })?
            .map_err(ChatError::Store)
    }

    /// Find-or-create the conversation of an unordered pair.
    pub async fn resolve(&self, a: Uuid, b: Uuid) -> Result<Conversation, ChatError> {
        self.store(move |db| db.upsert_conversation(a, b)).await
    }

    /// Validate, persist and append a message, then push it to both rooms.
    pub async fn send(&self, author: Uuid, msg: NewMessage) -> Result<Message, ChatError> {
        validate_new_message(author, &msg)?;

        let receiver = msg.receiver;
        if self.store(move |db| db.get_profile(receiver)).await?.is_none() {
            return Err(ChatError::validation("Unknown receiver"));
        }

        let conversation = self.resolve(msg.sender, msg.receiver).await?;

        let (sender, receiver) = (msg.sender, msg.receiver);
        let message = self
            .store(move |db| {
                db.append_message(
                    conversation.id,
                    NewMessageRow {
                        id: Uuid::new_v4(),
                        text: non_blank(&msg.text),
                        image_url: non_blank(&msg.image_url),
                        video_url: non_blank(&msg.video_url),
                        msg_by_user_id: msg.msg_by_user_id,
                    },
                )
            })
            .await?;

        info!(
            "{} -> {} message {} in conversation {}",
            sender, receiver, message.id, message.conversation_id
        );

        let event = ServerEvent::Message(MessagePayload::New(message.clone()));
        self.dispatcher.send_to_user(sender, event.clone()).await;
        self.dispatcher.send_to_user(receiver, event).await;

        Ok(message)
    }

    /// Peer header and full history. No conversation yet means no messages.
    pub async fn history(&self, requester: Uuid, peer: Uuid) -> Result<History, ChatError> {
        let (profile, messages) = self
            .store(move |db| {
                let profile = db.get_profile(peer)?;
                let messages = match db.find_conversation(requester, peer)? {
                    Some(conversation) => db.conversation_messages(conversation.id)?,
                    None => Vec::new(),
                };
                Ok((profile, messages))
            })
            .await?;

        let profile = profile.ok_or_else(|| ChatError::validation("Unknown peer"))?;
        let online = self.dispatcher.is_online(peer).await;

        Ok(History {
            peer: PeerHeader::new(profile, online),
            messages,
        })
    }

    /// Answer `message-page` on the requesting connection only.
    pub async fn open_page(&self, requester: Uuid, conn_id: Uuid, peer: Uuid) -> Result<(), ChatError> {
        let history = self.history(requester, peer).await?;

        self.dispatcher
            .send_to_connection(requester, conn_id, ServerEvent::MessageUser(history.peer))
            .await;
        self.dispatcher
            .send_to_connection(
                requester,
                conn_id,
                ServerEvent::Message(MessagePayload::History(history.messages)),
            )
            .await;
        Ok(())
    }

    /// Mark every message `counterparty` wrote to `viewer` as seen, then
    /// push the updated messages and both sidebars to both users. A pair with
    /// no conversation is not created; both sides get an empty list instead.
    pub async fn mark_seen(&self, viewer: Uuid, counterparty: Uuid) -> Result<(), ChatError> {
        let (changed, messages, viewer_sidebar, counterparty_sidebar) = self
            .store(move |db| {
                let (changed, messages) = match db.find_conversation(viewer, counterparty)? {
                    Some(conversation) => {
                        let changed = db.mark_seen(conversation.id, counterparty)?;
                        (changed, db.conversation_messages(conversation.id)?)
                    }
                    None => (0, Vec::new()),
                };
                let viewer_sidebar = db.conversation_summaries(viewer)?;
                let counterparty_sidebar = db.conversation_summaries(counterparty)?;
                Ok((changed, messages, viewer_sidebar, counterparty_sidebar))
            })
            .await?;

        debug!("{} saw {} messages from {}", viewer, changed, counterparty);

        let read = ServerEvent::MessageRead(messages);
        self.dispatcher.send_to_user(viewer, read.clone()).await;
        self.dispatcher.send_to_user(counterparty, read).await;

        self.dispatcher
            .send_to_user(viewer, ServerEvent::Conversation(viewer_sidebar))
            .await;
        self.dispatcher
            .send_to_user(counterparty, ServerEvent::Conversation(counterparty_sidebar))
            .await;
        Ok(())
    }

    pub async fn sidebar(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, ChatError> {
        self.store(move |db| db.conversation_summaries(user_id)).await
    }

    /// Answer `sidebar` on the requesting connection only.
    pub async fn refresh_sidebar(&self, user_id: Uuid, conn_id: Uuid, requested: Uuid) -> Result<(), ChatError> {
        if requested != user_id {
            return Err(ChatError::validation("Sidebar may only be requested for yourself"));
        }

        let summaries = self.sidebar(user_id).await?;
        self.dispatcher
            .send_to_connection(user_id, conn_id, ServerEvent::Conversation(summaries))
            .await;
        Ok(())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn validate_new_message(author: Uuid, msg: &NewMessage) -> Result<(), ChatError> {
    if msg.sender != author || msg.msg_by_user_id != author {
        return Err(ChatError::validation("Sender must be the authenticated user"));
    }
    if msg.receiver == msg.sender {
        return Err(ChatError::validation("Cannot message yourself"));
    }

    let text = non_blank(&msg.text);
    if text.is_none() && non_blank(&msg.image_url).is_none() && non_blank(&msg.video_url).is_none() {
        return Err(ChatError::validation("Message has no text or media"));
    }
    if text.is_some_and(|t| t.chars().count() > MAX_MESSAGE_LEN) {
        return Err(ChatError::validation("Message text too long"));
    }

    Ok(())
}

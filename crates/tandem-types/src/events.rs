use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationSummary, Message, PeerHeader};

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Full presence snapshot, ordered by first connect
    #[serde(rename = "onlineUser")]
    OnlineUser(Vec<Uuid>),

    /// Profile and presence of the peer whose page was opened
    #[serde(rename = "message-user")]
    MessageUser(PeerHeader),

    /// Conversation history, or a single freshly persisted message
    #[serde(rename = "message")]
    Message(MessagePayload),

    /// Conversation messages after a read-receipt update
    #[serde(rename = "message-read")]
    MessageRead(Vec<Message>),

    /// Sidebar summaries of the receiving user
    #[serde(rename = "conversation")]
    Conversation(Vec<ConversationSummary>),

    /// Failed acknowledgment of a client command
    #[serde(rename = "error")]
    Error {
        event: String,
        kind: ErrorKind,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    History(Vec<Message>),
    New(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Validation,
    StoreUnavailable,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Open the conversation page of a peer
    #[serde(rename = "message-page")]
    MessagePage(Uuid),

    #[serde(rename = "new message")]
    NewMessage(NewMessage),

    /// Mark every message of the given counterparty as seen
    #[serde(rename = "seen")]
    Seen(Uuid),

    /// Request the sidebar of the given (own) user
    #[serde(rename = "sidebar")]
    Sidebar(Uuid),

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl ClientCommand {
    /// Wire name of the command, echoed back in `error` events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessagePage(_) => "message-page",
            Self::NewMessage(_) => "new message",
            Self::Seen(_) => "seen",
            Self::Sidebar(_) => "sidebar",
            Self::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub sender: Uuid,
    pub receiver: Uuid,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    pub msg_by_user_id: Uuid,
}

// Chat module: the rendezvous channel seam
//
// The core only needs to connect and join a channel, send text to the channel
// or to a user, receive text with the sender's identity, and quit. `irc` is
// the real transport; `memory` is an in-process hub for tests.

pub mod irc;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use irc::{IrcConfig, IrcConnector};
pub use memory::{MemoryChatConnector, MemoryChatHub};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Timed out connecting to chat server")]
    ConnectTimeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Registration failed: {0}")]
    Registration(String),
    #[error("Could not join {channel}: {reason}")]
    JoinFailed { channel: String, reason: String },
    #[error("Chat connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// MESSAGES AND SESSIONS
// ============================================================================

/// A text message received on the chat transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Nick of the originator
    pub sender: String,
    /// Channel name, or our own nick for a private message
    pub target: String,
    pub body: String,
}

impl ChatMessage {
    pub fn new(
        sender: impl Into<String>,
        target: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            body: body.into(),
        }
    }

    /// True if the message was sent to a channel rather than to a user
    pub fn is_channel_message(&self) -> bool {
        is_channel_name(&self.target)
    }
}

pub fn is_channel_name(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// Outbound half of a chat session, shareable between tasks
#[async_trait]
pub trait ChatLink: Send + Sync {
    /// Send a text message to a channel or a user
    async fn send_text(&self, target: &str, text: &str) -> Result<(), ChatError>;

    /// Leave the server. Further sends fail.
    async fn quit(&self, reason: &str) -> Result<(), ChatError>;
}

/// A connected chat session that has joined its channel
pub struct ChatSession {
    nick: String,
    channel: String,
    link: Arc<dyn ChatLink>,
    incoming: mpsc::Receiver<ChatMessage>,
}

impl ChatSession {
    pub fn new(
        nick: String,
        channel: String,
        link: Arc<dyn ChatLink>,
        incoming: mpsc::Receiver<ChatMessage>,
    ) -> Self {
        Self {
            nick,
            channel,
            link,
            incoming,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn link(&self) -> Arc<dyn ChatLink> {
        Arc::clone(&self.link)
    }

    /// Send text to the joined channel
    pub async fn broadcast(&self, text: &str) -> Result<(), ChatError> {
        self.link.send_text(&self.channel, text).await
    }

    pub async fn send_private(&self, nick: &str, text: &str) -> Result<(), ChatError> {
        self.link.send_text(nick, text).await
    }

    /// Next incoming message, or `None` once the connection is gone
    pub async fn next_message(&mut self) -> Option<ChatMessage> {
        self.incoming.recv().await
    }

    /// Quit and drop the session
    pub async fn quit(self, reason: &str) -> Result<(), ChatError> {
        self.link.quit(reason).await
    }
}

/// Opens chat sessions: connect, register, join the configured channel
#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn connect(&self) -> Result<ChatSession, ChatError>;
}

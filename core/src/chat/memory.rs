//! In-process chat hub
//!
//! Routes channel messages to every other member and private messages to the
//! named nick. Records everything sent so tests can assert on traffic without
//! a chat server.

use super::{is_channel_name, ChatConnector, ChatError, ChatLink, ChatMessage, ChatSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct HubState {
    members: HashMap<String, mpsc::Sender<ChatMessage>>,
    sent: Vec<ChatMessage>,
    quits: Vec<(String, String)>,
    connects: usize,
    failing_connects: usize,
    next_id: u64,
}

/// Shared in-memory chat server with a single channel
#[derive(Clone)]
pub struct MemoryChatHub {
    channel: String,
    state: Arc<Mutex<HubState>>,
}

impl MemoryChatHub {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// A connector whose sessions get nicks `<prefix>1`, `<prefix>2`, ...
    pub fn connector(&self, nick_prefix: impl Into<String>) -> MemoryChatConnector {
        MemoryChatConnector {
            hub: self.clone(),
            nick_prefix: nick_prefix.into(),
        }
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    /// Deliver a message as if `message.sender` had sent it
    pub fn inject(&self, message: ChatMessage) {
        let mut state = self.state.lock();
        Self::route(&self.channel, &mut state, message);
    }

    /// Every message sent through the hub, in order
    pub fn sent(&self) -> Vec<ChatMessage> {
        self.state.lock().sent.clone()
    }

    /// Messages sent to the channel
    pub fn channel_messages(&self) -> Vec<ChatMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.target == self.channel)
            .collect()
    }

    /// Messages sent privately to `nick`
    pub fn private_messages_to(&self, nick: &str) -> Vec<ChatMessage> {
        self.sent().into_iter().filter(|m| m.target == nick).collect()
    }

    /// Number of successful connections so far
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// `(nick, reason)` of every session that quit
    pub fn quits(&self) -> Vec<(String, String)> {
        self.state.lock().quits.clone()
    }

    /// Drop `nick` from the server as if the connection had been lost
    pub fn disconnect(&self, nick: &str) {
        self.state.lock().members.remove(nick);
    }

    /// Nicks currently connected
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.state.lock().members.keys().cloned().collect();
        members.sort();
        members
    }

    fn route(channel: &str, state: &mut HubState, message: ChatMessage) {
        state.sent.push(message.clone());

        if is_channel_name(&message.target) {
            if message.target != channel {
                return;
            }
            state.members.retain(|nick, tx| {
                if *nick == message.sender {
                    return true;
                }
                !matches!(
                    tx.try_send(message.clone()),
                    Err(mpsc::error::TrySendError::Closed(_))
                )
            });
        } else if let Some(tx) = state.members.get(&message.target) {
            if tx.try_send(message.clone()).is_err() {
                state.members.remove(&message.target);
            }
        }
    }
}

/// Opens sessions on a [`MemoryChatHub`]
#[derive(Clone)]
pub struct MemoryChatConnector {
    hub: MemoryChatHub,
    nick_prefix: String,
}

#[async_trait]
impl ChatConnector for MemoryChatConnector {
    async fn connect(&self) -> Result<ChatSession, ChatError> {
        let (tx, rx) = mpsc::channel(64);
        let nick = {
            let mut state = self.hub.state.lock();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(ChatError::ConnectTimeout);
            }
            state.next_id += 1;
            state.connects += 1;
            let nick = format!("{}{}", self.nick_prefix, state.next_id);
            state.members.insert(nick.clone(), tx);
            nick
        };

        let link = MemoryLink {
            hub: self.hub.clone(),
            nick: nick.clone(),
        };
        Ok(ChatSession::new(
            nick,
            self.hub.channel.clone(),
            Arc::new(link),
            rx,
        ))
    }
}

struct MemoryLink {
    hub: MemoryChatHub,
    nick: String,
}

#[async_trait]
impl ChatLink for MemoryLink {
    async fn send_text(&self, target: &str, text: &str) -> Result<(), ChatError> {
        let mut state = self.hub.state.lock();
        if !state.members.contains_key(&self.nick) {
            return Err(ChatError::Closed);
        }
        let message = ChatMessage::new(self.nick.clone(), target, text);
        MemoryChatHub::route(&self.hub.channel, &mut state, message);
        Ok(())
    }

    async fn quit(&self, reason: &str) -> Result<(), ChatError> {
        let mut state = self.hub.state.lock();
        state.members.remove(&self.nick);
        state.quits.push((self.nick.clone(), reason.to_string()));
        Ok(())
    }
}

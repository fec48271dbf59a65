//! Rendezvous wire format: bootstrap request and reply as chat text
//!
//! Request: the bare token, sent to the channel.
//! Reply: `<token> <host:port> <host:port> ...`, sent privately to the requester.

use crate::peer::{parse_peer_entries, PeerAddress, PeerList};
use rand::seq::SliceRandom;
use rand::Rng;

/// Default bootstrap command token
pub const DEFAULT_BOOTSTRAP_TOKEN: &str = "!bootstrap";

/// Maximum number of sampled peers in one reply; the responder appends itself,
/// so a reply never carries more than `MAX_SAMPLED_PEERS + 1` entries.
pub const MAX_SAMPLED_PEERS: usize = 19;

/// Byte budget for an encoded reply. IRC lines are 512 bytes including the
/// relaying server's `:nick!user@host PRIVMSG <target> :` prefix and CRLF.
pub const MAX_REPLY_BYTES: usize = 400;

/// Whether a chat message body is a bootstrap request
pub fn is_bootstrap_request(body: &str, token: &str) -> bool {
    body.trim() == token
}

/// A parsed or to-be-sent bootstrap reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousReply {
    pub token: String,
    pub peers: PeerList,
}

impl RendezvousReply {
    pub fn new(token: impl Into<String>, peers: PeerList) -> Self {
        Self {
            token: token.into(),
            peers,
        }
    }

    /// Render as a single chat line
    pub fn encode(&self) -> String {
        let mut line = self.token.clone();
        for peer in &self.peers {
            line.push(' ');
            line.push_str(&peer.to_string());
        }
        line
    }

    /// Parse a chat line as a reply for `token`.
    ///
    /// Returns `None` unless the first whitespace-separated word is exactly
    /// the token. Malformed entries after it are skipped.
    pub fn parse(line: &str, token: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        if words.next()? != token {
            return None;
        }
        Some(Self::new(token, parse_peer_entries(words)))
    }
}

/// Uniformly sample `MAX_SAMPLED_PEERS` addresses without replacement when
/// there are more than that; otherwise return them all unchanged.
pub fn sample_peers<R: Rng + ?Sized>(peers: PeerList, rng: &mut R) -> PeerList {
    if peers.len() <= MAX_SAMPLED_PEERS {
        return peers;
    }
    peers
        .choose_multiple(rng, MAX_SAMPLED_PEERS)
        .cloned()
        .collect()
}

/// Build the reply a responder sends: sampled known peers plus itself last.
///
/// Sampled entries are dropped from the end until the encoded line fits
/// `MAX_REPLY_BYTES`; the responder's own entry is always kept.
pub fn build_reply<R: Rng + ?Sized>(
    token: &str,
    known: PeerList,
    own: PeerAddress,
    rng: &mut R,
) -> RendezvousReply {
    let sampled = sample_peers(known, rng);

    let mut used = token.len() + 1 + own.to_string().len();
    let mut peers = PeerList::with_capacity(sampled.len() + 1);
    for peer in sampled {
        let cost = 1 + peer.to_string().len();
        if used + cost > MAX_REPLY_BYTES {
            break;
        }
        used += cost;
        peers.push(peer);
    }
    peers.push(own);
    RendezvousReply::new(token, peers)
}

// ============================================================================
// TESTS
// ============================================================================

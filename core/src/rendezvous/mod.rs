// Rendezvous module: bootstrap over a shared chat channel
//
// protocol: wire format of requests and replies
// backoff: delay schedule shared by retries and reconnects
// responder: the side that answers
// acquirer: the side that asks, with cache fallback and retries

pub mod acquirer;
pub mod backoff;
pub mod protocol;
pub mod responder;

pub use acquirer::{
    AcquireError, Acquired, AcquiredVia, AcquirerConfig, AcquisitionState, BootstrapAcquirer,
    QUIT_BOOTSTRAP_COMPLETE,
};
pub use backoff::BackoffPolicy;
pub use protocol::{
    build_reply, is_bootstrap_request, sample_peers, RendezvousReply, DEFAULT_BOOTSTRAP_TOKEN,
    MAX_REPLY_BYTES, MAX_SAMPLED_PEERS,
};
pub use responder::{RendezvousResponder, ResponderConfig};

// Store module: durable peer cache

pub mod nodelist;

pub use nodelist::{PeerListError, PeerListStore, NODELIST_FILE};

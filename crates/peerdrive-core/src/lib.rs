//! Peerdrive Core Library
//!
//! P2P file synchronization and messaging over a shared-secret topic.
//!
//! ## Overview
//!
//! A peerdrive node watches a local directory, content-hashes its files, and
//! publishes their metadata as an append-only signed log. Nodes that share a
//! network key discover each other over a gossip topic, replicate each
//! other's logs, and stream whole file contents on demand. Optional archive
//! mode pulls every file advertised on the network that the node does not
//! yet hold.
//!
//! ## Core principles
//!
//! - **One writer per log**: every node is the sole author of its own index;
//!   peers only ever read it.
//! - **Content addressed**: files are identified by their SHA-256; transfers
//!   move single blobs over iroh.
//! - **Local-first**: the watch directory is the source of truth; the index
//!   follows it, never the other way around.
//!
//! ## Quick start
//!
//! ```ignore
//! use peerdrive_core::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("~/shared", "~/.peerdrive");
//!     let node = Node::open(config).await?;
//!
//!     // Join (or create) a network
//!     let key = node.join(None).await?;
//!     println!("network key: {}", key.to_hex());
//!
//!     // Watch what happens
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod config;
pub mod error;
pub mod events;
pub mod hashing;
pub mod index;
pub mod journal;
pub mod logging;
pub mod messages;
pub mod net;
pub mod paths;
pub mod protocol;
pub mod transfer;
pub mod types;

mod node;

// Re-exports
pub use blobs::BlobStore;
pub use config::{IndexOptions, LogOptions, NodeConfig, SaveData};
pub use error::{NodeError, NodeResult};
pub use events::NodeEvent;
pub use index::{IndexManager, LocalIndex};
pub use journal::{Journal, Log};
pub use node::Node;
pub use protocol::{ResponseEnvelope, ResponseStatus};
pub use transfer::{TransferEntry, TransferTable};
pub use types::{BlobId, FileRecord, NetworkKey, NodeSeed, TransferDirection, TransferRef};

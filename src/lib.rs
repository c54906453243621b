//! Zkitter protocol node.
//!
//! Messages arrive from pubsub, carry either a signature by a registered
//! address or an anonymous zero-knowledge proof of group membership, and are
//! stored only after that proof has been re-verified locally.
//!
//! # Components
//!
//! - [`GroupRegistry`]: membership groups with historical merkle roots
//! - [`ProofVerifier`]: signature and group proof checks
//! - [`ContentStore`]: deduplicating, content-addressed message storage
//! - [`PubsubGateway`]: query/subscribe/write over a [`Transport`]
//! - [`IngestionCoordinator`]: the single verified insert path
//! - [`Node`]: composition root
//!
//! # Example
//!
//! ```no_run
//! use zkitter_node::{Config, Node};
//!
//! # async fn run() -> Result<(), zkitter_node::NodeError> {
//! let node = Node::initialize(Config::default()).await?;
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod ethereum;
pub mod gateway;
pub mod groups;
pub mod identity;
pub mod merkle;
pub mod node;
pub mod nullifier;
pub mod storage;
pub mod transport;
pub mod types;
pub mod users;
pub mod utils;
pub mod verifier;


pub use circuit::{GroupProofSystem, Halo2ProofSystem, MembershipWitness};
pub use config::Config;
pub use content::{ContentStore, Cursor, InsertResult, Page, StoredMessage};
pub use coordinator::{IngestionCoordinator, InsertOutcome, NodeEvent};
pub use error::{NodeError, StorageError, TransportError};
pub use gateway::{Author, Draft, MessageHandler, Published, PubsubGateway, Subscription};
pub use groups::{
    GroupAdapter, GroupRegistry, MembershipSource, OpenGroup, ReputationGroup, StaticGroup,
};
pub use identity::Identity;
pub use merkle::{IncrementalTree, MerklePath};
pub use node::{Node, NodeBuilder};
pub use storage::{KvStore, MemoryStore, SledStore};
pub use transport::{MemoryTransport, Topic, Transport};
pub use types::{Envelope, GroupId, Hash32, Message, MessageKind, MessageType, Proof};
pub use users::{AddressFeed, MemoryAddressFeed, UserRecord, UserRegistry};
pub use verifier::{ProofVerifier, RejectReason, Verdict};

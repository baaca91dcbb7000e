//! plait-core library.
//!
//! Content-addressed event logs replicated per topic between peers over an
//! unreliable transport. Each topic forms a DAG: every locally published
//! event links the topic's current heads, and replicas fetch missing links
//! from peers until their stores converge.
//!
//! # Conventions
//!
//! - **Errors**: each module has its own `thiserror` enum mapping to a stable
//!   [`error::ErrorCode`]; `anyhow::Result` only at config-loading edges.
//! - **Logging**: `tracing` macros, with one span per replica loop.

pub mod config;
pub mod error;
pub mod event;
pub mod net;
pub mod node;
pub mod query;
pub mod replica;
pub mod store;

pub use event::{Cid, Envelope, Event, EventError, TimeKey};
pub use net::{Broadcaster, NetError, NodeBroadcaster, NodeSyncer, Syncer};
pub use node::{Node, NodeError};
pub use query::{Cursor, Direction, QueryError, QueryPage, QueryRequest};
pub use replica::{Replica, ReplicaError, ReplicaParts};
pub use store::{NodeStore, Store, StoreError};

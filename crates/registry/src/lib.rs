//! Registry of the file transfers belonging to one room.
//!
//! The application talks only to [`TransferRegistry`]. It routes inbound
//! peer channels to receivers (one per file id), starts HTTP uploads, opens
//! outgoing peer transfers, and keeps the room's transfer list persisted so
//! everything can be rebuilt after a restart.

pub mod config;
pub mod error;
pub mod peer;
pub mod registry;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use peer::{OutgoingTransfer, PeerConnection, file_id_from_label};
pub use registry::{RegistryContext, Transfer, TransferRegistry};

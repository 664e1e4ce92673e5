//! Outgoing peer transfers.
//!
//! The application implements [`PeerConnection`] on top of its peer
//! connection; the registry only ever asks it for a fresh data channel.

use std::sync::Arc;

use fireside_data_channel::{
    ChannelEndpoint, DataChannelError, LABEL_PREFIX, PeerSender, PeerTransferConfig,
};
use fireside_transfer::{BoxFuture, FileHandle};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// A connected transfer partner.
pub trait PeerConnection: Send + Sync {
    /// The partner's user id.
    fn uid(&self) -> &str;

    /// Opens an ordered, reliable data channel named `label`.
    fn open_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Result<ChannelEndpoint, DataChannelError>>;
}

/// A peer sender serving one file over its own channel.
#[derive(Debug)]
pub struct OutgoingTransfer {
    pub label: String,
    pub peer_uid: String,
    /// Finishes when the receiver closes the channel.
    pub task: JoinHandle<Result<(), DataChannelError>>,
}

/// Extracts the file id from a transfer channel label (`filetransfer:<id>`).
pub fn file_id_from_label(label: &str) -> Option<&str> {
    label.strip_prefix(LABEL_PREFIX).filter(|id| !id.is_empty())
}

pub(crate) async fn send_to_peer(
    peer: &dyn PeerConnection,
    file: Arc<dyn FileHandle>,
    config: PeerTransferConfig,
) -> Result<OutgoingTransfer, DataChannelError> {
    let label = format!("{LABEL_PREFIX}{}", Uuid::new_v4());
    let endpoint = peer.open_data_channel(&label).await?;
    info!(
        peer = %peer.uid(),
        label = %label,
        file = %file.filename(),
        size = file.filesize(),
        "offering file to peer"
    );
    let task = PeerSender::spawn(file, endpoint, config);
    Ok(OutgoingTransfer {
        label,
        peer_uid: peer.uid().to_string(),
        task,
    })
}

//! Peer sender: answers metadata and block requests from a receiver.

use std::collections::VecDeque;
use std::sync::Arc;

use fireside_protocol::{ControlMessage, FileMetadata, chunk_offset, encode_chunk, num_chunks};
use fireside_transfer::FileHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::PeerTransferConfig;
use crate::channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, DataChannel};
use crate::error::DataChannelError;

/// Chunks of one block, in index order.
type Block = Vec<Vec<u8>>;

/// A block read running on its own task.
type PendingBlock = JoinHandle<Result<Block, DataChannelError>>;

/// Serves a file to one receiver over one channel.
///
/// Stateless across channels: a reconnecting receiver gets a fresh sender
/// and asks for the block it needs. Chunks are fire-and-forget; the channel
/// guarantees delivery and order.
pub struct PeerSender {
    file: Arc<dyn FileHandle>,
    channel: Arc<dyn DataChannel>,
    config: PeerTransferConfig,
    num_chunks: u32,
    cache: VecDeque<(u32, PendingBlock)>,
}

impl PeerSender {
    pub fn new(
        file: Arc<dyn FileHandle>,
        channel: Arc<dyn DataChannel>,
        config: PeerTransferConfig,
    ) -> Self {
        let num_chunks = num_chunks(file.filesize(), config.chunk_size);
        Self {
            file,
            channel,
            config,
            num_chunks,
            cache: VecDeque::new(),
        }
    }

    /// Spawns the sender on its own task.
    pub fn spawn(
        file: Arc<dyn FileHandle>,
        endpoint: ChannelEndpoint,
        config: PeerTransferConfig,
    ) -> JoinHandle<Result<(), DataChannelError>> {
        let sender = Self::new(file, endpoint.channel, config);
        tokio::spawn(sender.run(endpoint.events))
    }

    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// Handles requests until the channel closes.
    ///
    /// Returns an error only if reading the file fails.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<(), DataChannelError> {
        info!(
            label = %self.channel.label(),
            file = %self.file.filename(),
            size = self.file.filesize(),
            chunks = self.num_chunks,
            "peer sender started"
        );

        while let Some(event) = events.recv().await {
            let text = match event {
                ChannelEvent::Message(ChannelMessage::Text(text)) => text,
                ChannelEvent::Message(ChannelMessage::Binary(data)) => {
                    debug!(len = data.len(), "ignoring binary frame sent to peer sender");
                    continue;
                }
                ChannelEvent::Open => continue,
                ChannelEvent::Close => break,
            };

            let message = match ControlMessage::from_json(&text) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed control message");
                    continue;
                }
            };

            let result = match message {
                ControlMessage::RequestMetadata => self.send_metadata().await,
                ControlMessage::RequestChunks { index } => self.send_block(index).await,
                ControlMessage::Metadata { .. } => {
                    debug!("ignoring metadata sent to peer sender");
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(DataChannelError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "peer sender failed");
                    return Err(e);
                }
            }
        }

        info!(label = %self.channel.label(), "peer sender finished");
        Ok(())
    }

    fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.file.filename().to_string(),
            size: self.file.filesize(),
            mime_type: self.file.mime_type().to_string(),
        }
    }

    async fn send_metadata(&self) -> Result<(), DataChannelError> {
        let json = ControlMessage::Metadata {
            metadata: self.metadata(),
        }
        .to_json()?;
        self.channel.send(ChannelMessage::Text(json)).await
    }

    async fn send_block(&mut self, index: u32) -> Result<(), DataChannelError> {
        if index >= self.num_chunks {
            warn!(index, chunks = self.num_chunks, "block request past end of file");
            return Ok(());
        }

        let cached = self.take_cached(index);
        let next = index.saturating_add(self.config.chunks_per_block.max(1));
        if self.config.block_cache_size > 0 && next < self.num_chunks && !self.is_cached(next) {
            self.prefetch(next);
        }

        let block = match cached {
            Some(pending) => match pending.await {
                Ok(Ok(block)) => block,
                Ok(Err(e)) => {
                    warn!(index, error = %e, "block prefetch failed, reading again");
                    self.read_block(index).await?
                }
                Err(e) => {
                    warn!(index, error = %e, "block prefetch task failed, reading again");
                    self.read_block(index).await?
                }
            },
            None => self.read_block(index).await?,
        };

        debug!(index, chunks = block.len(), "sending block");
        for (i, payload) in block.iter().enumerate() {
            let chunk_index = index + i as u32;
            trace!(index = chunk_index, len = payload.len(), "sending chunk");
            let frame = encode_chunk(chunk_index, payload);
            self.channel.send(ChannelMessage::Binary(frame)).await?;
        }
        Ok(())
    }

    async fn read_block(&self, start: u32) -> Result<Block, DataChannelError> {
        read_block(&*self.file, start, &self.config, self.num_chunks).await
    }

    /// Starts reading the block at `start` without waiting for it.
    fn prefetch(&mut self, start: u32) {
        let file = Arc::clone(&self.file);
        let config = self.config.clone();
        let total = self.num_chunks;
        let pending = tokio::spawn(async move { read_block(&*file, start, &config, total).await });
        self.cache.push_back((start, pending));
        while self.cache.len() > self.config.block_cache_size {
            if let Some((evicted, pending)) = self.cache.pop_front() {
                trace!(index = evicted, "evicting cached block");
                pending.abort();
            }
        }
    }

    fn is_cached(&self, index: u32) -> bool {
        self.cache.iter().any(|(i, _)| *i == index)
    }

    fn take_cached(&mut self, index: u32) -> Option<PendingBlock> {
        let pos = self.cache.iter().position(|(i, _)| *i == index)?;
        self.cache.remove(pos).map(|(_, pending)| pending)
    }

    #[cfg(test)]
    fn cached_indices(&self) -> Vec<u32> {
        self.cache.iter().map(|(i, _)| *i).collect()
    }
}

impl Drop for PeerSender {
    fn drop(&mut self) {
        for (_, pending) in self.cache.drain(..) {
            pending.abort();
        }
    }
}

/// Reads the block starting at chunk `start`, split into chunks.
async fn read_block(
    file: &dyn FileHandle,
    start: u32,
    config: &PeerTransferConfig,
    num_chunks: u32,
) -> Result<Block, DataChannelError> {
    let chunk_size = config.chunk_size;
    let end = start
        .saturating_add(config.chunks_per_block.max(1))
        .min(num_chunks);
    let offset = chunk_offset(start, chunk_size);
    let len = chunk_offset(end, chunk_size).min(file.filesize()) - offset;

    let data = file.read_at(offset, len).await?;
    Ok(data
        .chunks(chunk_size.max(1) as usize)
        .map(<[u8]>::to_vec)
        .collect())
}

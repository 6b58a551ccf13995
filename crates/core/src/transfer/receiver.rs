//! Receiving side of the transfer protocol

use std::mem;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{format_size, FileMetadata, Frame};
use crate::error::Result;
use crate::transport::{ChannelMessage, DataChannel};

/// Name used when the sender supplied none
pub const DEFAULT_FILE_NAME: &str = "received_file";

/// A completed inbound file
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Write the file into `dir`, keeping only the final path component of
    /// the advertised name.
    pub async fn save_into(&self, dir: &Path) -> Result<PathBuf> {
        let file_name = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.into());
        let path = dir.join(file_name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// A file whose metadata arrived and whose terminator has not
#[derive(Debug)]
pub struct InboundTransfer {
    metadata: FileMetadata,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl InboundTransfer {
    fn new(metadata: FileMetadata) -> Self {
        Self {
            metadata,
            chunks: Vec::new(),
            received: 0,
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Bytes accumulated so far
    pub fn received(&self) -> u64 {
        self.received
    }

    fn push(&mut self, chunk: Vec<u8>) {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    fn finish(self) -> ReceivedFile {
        let name = if self.metadata.name.is_empty() {
            DEFAULT_FILE_NAME.to_string()
        } else {
            self.metadata.name
        };
        ReceivedFile {
            name,
            content_type: self.metadata.content_type,
            data: self.chunks.concat(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
enum ReceiveState {
    #[default]
    AwaitingMetadata,
    Receiving(InboundTransfer),
}

/// Reassembles files from the frames of one channel.
///
/// At most one file is in progress. The first frame of each session must
/// be metadata; everything after it is data until the terminator.
#[derive(Debug, Default)]
pub struct TransferReceiver {
    state: ReceiveState,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ReceiveState::Receiving(_))
    }

    pub fn current(&self) -> Option<&InboundTransfer> {
        match &self.state {
            ReceiveState::Receiving(transfer) => Some(transfer),
            ReceiveState::AwaitingMetadata => None,
        }
    }

    /// Feed one frame. Returns the finished file when the terminator
    /// arrives. A malformed metadata frame is an error and leaves the
    /// receiver waiting for metadata.
    pub fn on_message(&mut self, message: ChannelMessage) -> Result<Option<ReceivedFile>> {
        match mem::take(&mut self.state) {
            ReceiveState::AwaitingMetadata => {
                let metadata = Frame::decode_metadata(message)?;
                debug!(name = %metadata.name, size = metadata.size, "Receiving file");
                self.state = ReceiveState::Receiving(InboundTransfer::new(metadata));
                Ok(None)
            }
            ReceiveState::Receiving(mut transfer) => match Frame::decode_chunk(message) {
                Some(chunk) => {
                    transfer.push(chunk);
                    self.state = ReceiveState::Receiving(transfer);
                    Ok(None)
                }
                None => Ok(Some(transfer.finish())),
            },
        }
    }

    /// Abandon any file in progress, returning its metadata
    pub fn on_close(&mut self) -> Option<FileMetadata> {
        match mem::take(&mut self.state) {
            ReceiveState::Receiving(transfer) => Some(transfer.metadata),
            ReceiveState::AwaitingMetadata => None,
        }
    }
}

/// Outcome of a receive session
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Received(ReceivedFile),
    /// Channel closed before the terminator
    Abandoned(FileMetadata),
}

/// Drain `channel` until it closes, reporting each completed file
pub async fn receive_loop<C: DataChannel + ?Sized>(
    channel: &C,
    events: mpsc::Sender<TransferEvent>,
) {
    let mut receiver = TransferReceiver::new();

    while let Some(message) = channel.recv().await {
        match receiver.on_message(message) {
            Ok(Some(file)) => {
                info!(name = %file.name, size = %format_size(file.size()), "File received");
                if events.send(TransferEvent::Received(file)).await.is_err() {
                    debug!("Transfer listener gone, stopping receive loop");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropping unexpected frame"),
        }
    }

    if let Some(metadata) = receiver.on_close() {
        warn!(name = %metadata.name, "Channel closed mid-transfer, discarding partial file");
        let _ = events.send(TransferEvent::Abandoned(metadata)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::memory::MemoryChannel;

    fn metadata_frame(name: &str, size: u64, content_type: &str) -> ChannelMessage {
        Frame::Metadata(FileMetadata::new(name, size, content_type))
            .encode()
            .unwrap()
    }

    fn eof() -> ChannelMessage {
        ChannelMessage::Text("EOF".into())
    }

    #[test]
    fn test_reassembles_chunks_in_order() {
        let mut receiver = TransferReceiver::new();
        assert!(receiver
            .on_message(metadata_frame("a.txt", 6, "text/plain"))
            .unwrap()
            .is_none());
        assert!(receiver.is_receiving());

        receiver
            .on_message(ChannelMessage::Binary(b"abc".to_vec()))
            .unwrap();
        receiver
            .on_message(ChannelMessage::Binary(b"def".to_vec()))
            .unwrap();
        assert_eq!(receiver.current().unwrap().received(), 6);

        let file = receiver.on_message(eof()).unwrap().unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.data, b"abcdef");
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn test_sequential_files() {
        let mut receiver = TransferReceiver::new();
        let mut names = Vec::new();
        for name in ["one", "two"] {
            receiver.on_message(metadata_frame(name, 1, "")).unwrap();
            receiver
                .on_message(ChannelMessage::Binary(vec![7]))
                .unwrap();
            names.push(receiver.on_message(eof()).unwrap().unwrap().name);
        }
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn test_binary_eof_is_data() {
        let mut receiver = TransferReceiver::new();
        receiver.on_message(metadata_frame("x", 3, "")).unwrap();
        assert!(receiver
            .on_message(ChannelMessage::Binary(b"EOF".to_vec()))
            .unwrap()
            .is_none());
        let file = receiver.on_message(eof()).unwrap().unwrap();
        assert_eq!(file.data, b"EOF");
    }

    #[test]
    fn test_bad_metadata_keeps_waiting() {
        let mut receiver = TransferReceiver::new();
        let err = receiver
            .on_message(ChannelMessage::Binary(vec![1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!receiver.is_receiving());

        receiver.on_message(metadata_frame("ok", 0, "")).unwrap();
        assert!(receiver.is_receiving());
    }

    #[test]
    fn test_empty_name_defaults() {
        let mut receiver = TransferReceiver::new();
        receiver.on_message(metadata_frame("", 0, "")).unwrap();
        let file = receiver.on_message(eof()).unwrap().unwrap();
        assert_eq!(file.name, DEFAULT_FILE_NAME);
        assert_eq!(file.size(), 0);
    }

    #[tokio::test]
    async fn test_close_mid_transfer_yields_no_file() {
        let (tx, rx) = MemoryChannel::pair("files");
        let (events_tx, mut events) = mpsc::channel(4);

        tx.send(metadata_frame("partial.bin", 10, "")).await.unwrap();
        tx.send(ChannelMessage::Binary(vec![0; 4])).await.unwrap();

        let task = tokio::spawn(async move { receive_loop(&rx, events_tx).await });
        tokio::task::yield_now().await;
        tx.close().await;
        task.await.unwrap();

        let mut received = 0;
        while let Some(event) = events.recv().await {
            if let TransferEvent::Received(_) = event {
                received += 1;
            }
        }
        assert_eq!(received, 0);
    }

    #[tokio::test]
    async fn test_save_into_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = ReceivedFile {
            name: "../../etc/passwd".into(),
            content_type: String::new(),
            data: b"root".to_vec(),
            received_at: Utc::now(),
        };
        let path = file.save_into(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("passwd"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"root");
    }
}

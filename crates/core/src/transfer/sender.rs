//! Sending side of the transfer protocol

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use super::{content_type_for, format_size, FileMetadata, Frame, Progress, TransferConfig};
use crate::error::{Error, Result};
use crate::transport::{DataChannel, LowWatermark};

/// Stream `source` to the peer as one file.
///
/// Sends the metadata frame, the data in `chunk_size` slices, then the
/// terminator. Each chunk waits for backpressure to clear before it is
/// handed to the channel, and `on_progress` runs after every chunk. An
/// empty source produces metadata followed directly by the terminator.
///
/// Returns the number of data bytes sent.
pub async fn send_file<C, R, F>(
    channel: &C,
    metadata: FileMetadata,
    mut source: R,
    config: &TransferConfig,
    mut on_progress: F,
) -> Result<u64>
where
    C: DataChannel + ?Sized,
    R: AsyncRead + Unpin,
    F: FnMut(Progress),
{
    if !channel.is_open() {
        return Err(Error::ChannelNotReady);
    }

    let total = metadata.size;
    let name = metadata.name.clone();
    info!(name = %name, size = %format_size(total), "Sending file");

    send_frame(channel, Frame::Metadata(metadata)).await?;

    let chunk_size = config.chunk_size.max(1);
    let mut sent: u64 = 0;
    loop {
        let chunk = read_chunk(&mut source, chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        wait_for_capacity(channel, config).await?;

        let len = chunk.len() as u64;
        send_frame(channel, Frame::Chunk(chunk)).await?;
        sent += len;
        on_progress(Progress {
            bytes_sent: sent,
            total,
        });
    }

    if sent == 0 {
        on_progress(Progress {
            bytes_sent: 0,
            total,
        });
    }

    send_frame(channel, Frame::End).await?;
    info!(name = %name, size = %format_size(sent), "File sent");
    Ok(sent)
}

/// Send a file from disk, inferring its name and content type
pub async fn send_path<C, F>(
    channel: &C,
    path: &Path,
    config: &TransferConfig,
    on_progress: F,
) -> Result<u64>
where
    C: DataChannel + ?Sized,
    F: FnMut(Progress),
{
    if !channel.is_open() {
        return Err(Error::ChannelNotReady);
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::ReadFailed(format!("{}: {}", path.display(), e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| Error::ReadFailed(format!("{}: {}", path.display(), e)))?
        .len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let metadata = FileMetadata::new(name.clone(), size, content_type_for(&name));

    send_file(channel, metadata, file, config, on_progress).await
}

async fn send_frame<C: DataChannel + ?Sized>(channel: &C, frame: Frame) -> Result<()> {
    let message = frame.encode()?;
    channel.send(message).await.map_err(|e| match e {
        Error::SendFailed(reason) => Error::SendFailed(reason),
        other => Error::SendFailed(other.to_string()),
    })
}

/// Fill up to `size` bytes, stopping early only at end of input
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::ReadFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Hold the next chunk while outstanding bytes exceed the high watermark
async fn wait_for_capacity<C: DataChannel + ?Sized>(
    channel: &C,
    config: &TransferConfig,
) -> Result<()> {
    let buffered = channel.buffered_amount();
    if buffered <= config.high_watermark {
        return Ok(());
    }

    debug!(
        buffered = buffered,
        high_watermark = config.high_watermark,
        "Applying backpressure"
    );

    match channel.wait_low_watermark(config.low_watermark).await {
        LowWatermark::Drained => Ok(()),
        LowWatermark::Closed => Err(Error::SendFailed(
            "channel closed during backpressure wait".into(),
        )),
        LowWatermark::Unsupported => loop {
            tokio::time::sleep(config.poll_interval).await;
            if !channel.is_open() {
                return Err(Error::SendFailed(
                    "channel closed during backpressure wait".into(),
                ));
            }
            if channel.buffered_amount() <= config.high_watermark {
                return Ok(());
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{receive_loop, TransferEvent};
    use crate::transport::memory::MemoryChannel;
    use crate::transport::ChannelMessage;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_ten_mib() {
        let (tx, rx) = MemoryChannel::pair("files");
        let (events_tx, mut events) = mpsc::channel(4);
        let receiver = tokio::spawn(async move { receive_loop(&rx, events_tx).await });

        let data = pattern(10 * 1024 * 1024);
        let meta = FileMetadata::new("big.bin", data.len() as u64, "application/octet-stream");
        let mut last = None;
        let sent = send_file(
            &tx,
            meta,
            Cursor::new(data.clone()),
            &TransferConfig::default(),
            |p| last = Some(p),
        )
        .await
        .unwrap();

        assert_eq!(sent, data.len() as u64);
        let last = last.unwrap();
        assert_eq!(last.percent(), 100);
        assert_eq!(last.bytes_sent, last.total);

        match events.recv().await.unwrap() {
            TransferEvent::Received(file) => {
                assert_eq!(file.name, "big.bin");
                assert_eq!(file.content_type, "application/octet-stream");
                assert!(file.data == data);
            }
            other => panic!("unexpected event {:?}", other),
        }

        tx.close().await;
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_byte_file_is_metadata_then_terminator() {
        let (tx, rx) = MemoryChannel::pair("files");
        let mut ticks = Vec::new();
        send_file(
            &tx,
            FileMetadata::new("empty.txt", 0, "text/plain"),
            Cursor::new(Vec::new()),
            &TransferConfig::default(),
            |p| ticks.push(p),
        )
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            ChannelMessage::Text(text) => assert!(text.contains("empty.txt")),
            other => panic!("expected metadata, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), ChannelMessage::Text("EOF".into()));
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].percent(), 100);
    }

    #[tokio::test]
    async fn test_close_after_send_still_delivers() {
        let (tx, rx) = MemoryChannel::pair("files");
        let data = pattern(3000);
        let config = TransferConfig {
            chunk_size: 1000,
            ..TransferConfig::default()
        };
        send_file(
            &tx,
            FileMetadata::new("last.bin", data.len() as u64, ""),
            Cursor::new(data.clone()),
            &config,
            |_| {},
        )
        .await
        .unwrap();
        tx.close().await;

        // Nothing was read before the close
        let (events_tx, mut events) = mpsc::channel(4);
        receive_loop(&rx, events_tx).await;

        match events.recv().await.unwrap() {
            TransferEvent::Received(file) => {
                assert_eq!(file.name, "last.bin");
                assert!(file.data == data);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.recv().await.is_none());
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_immediately() {
        let (tx, rx) = MemoryChannel::pair("files");
        rx.close().await;
        let err = send_file(
            &tx,
            FileMetadata::new("x", 1, ""),
            Cursor::new(vec![1]),
            &TransferConfig::default(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ChannelNotReady));
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_chunks_respect_chunk_size() {
        let (tx, rx) = MemoryChannel::pair("files");
        let config = TransferConfig {
            chunk_size: 4,
            ..TransferConfig::default()
        };
        send_file(
            &tx,
            FileMetadata::new("ten", 10, ""),
            Cursor::new(pattern(10)),
            &config,
            |_| {},
        )
        .await
        .unwrap();

        rx.recv().await.unwrap();
        let mut sizes = Vec::new();
        while let Some(ChannelMessage::Binary(chunk)) = rx.recv().await {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    async fn assert_backpressure(tx: MemoryChannel, rx: MemoryChannel, config: TransferConfig) {
        let tx = Arc::new(tx);
        let chunks = Arc::new(AtomicUsize::new(0));
        let sender = {
            let tx = tx.clone();
            let chunks = chunks.clone();
            let config = config.clone();
            tokio::spawn(async move {
                send_file(
                    tx.as_ref(),
                    FileMetadata::new("slow.bin", 4000, ""),
                    Cursor::new(pattern(4000)),
                    &config,
                    |_| {
                        chunks.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stalled_at = chunks.load(Ordering::SeqCst);
        assert!(stalled_at < 10, "sender never stalled");
        assert!(tx.buffered_amount() > config.high_watermark);
        assert!(!sender.is_finished());

        // Reading only the metadata frame leaves the buffer above the low mark
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(chunks.load(Ordering::SeqCst), stalled_at);

        let mut received = 0;
        while received < 4000 {
            match rx.recv().await.unwrap() {
                ChannelMessage::Binary(chunk) => received += chunk.len(),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(rx.recv().await.unwrap(), ChannelMessage::Text("EOF".into()));
        assert_eq!(sender.await.unwrap().unwrap(), 4000);
        assert_eq!(chunks.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_low_watermark() {
        let (tx, rx) = MemoryChannel::pair("files");
        let config = TransferConfig {
            chunk_size: 400,
            high_watermark: 1000,
            low_watermark: 100,
            poll_interval: Duration::from_millis(5),
        };
        assert_backpressure(tx, rx, config).await;
    }

    #[tokio::test]
    async fn test_backpressure_polls_without_signal() {
        let (tx, rx) = MemoryChannel::pair_without_low_signal("files");
        let config = TransferConfig {
            chunk_size: 400,
            high_watermark: 1000,
            low_watermark: 100,
            poll_interval: Duration::from_millis(5),
        };
        assert_backpressure(tx, rx, config).await;
    }

    #[tokio::test]
    async fn test_send_path_infers_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (tx, rx) = MemoryChannel::pair("files");
        let sent = send_path(&tx, &path, &TransferConfig::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(sent, 5);

        let meta = Frame::decode_metadata(rx.recv().await.unwrap()).unwrap();
        assert_eq!(meta, FileMetadata::new("notes.txt", 5, "text/plain"));
    }

    #[tokio::test]
    async fn test_send_path_missing_file() {
        let (tx, _rx) = MemoryChannel::pair("files");
        let err = send_path(
            &tx,
            Path::new("/definitely/not/here.bin"),
            &TransferConfig::default(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ReadFailed(_)));
    }
}

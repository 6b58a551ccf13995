//! Chunked file transfer over an ordered, reliable channel
//!
//! Wire format, per file:
//!
//! 1. a text frame holding JSON metadata `{name, size, type}`
//! 2. zero or more binary chunks of at most `chunk_size` bytes
//! 3. the text frame `EOF`
//!
//! There are no sequence numbers, acknowledgements or checksums. Ordering
//! and completeness come entirely from the channel.

mod frame;
mod mime;
mod receiver;
mod sender;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use frame::{Frame, TERMINATOR};
pub use mime::content_type_for;
pub use receiver::{receive_loop, InboundTransfer, ReceivedFile, TransferEvent, TransferReceiver};
pub use sender::{send_file, send_path};

/// Default chunk size (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default high watermark on outstanding bytes (4 MiB)
pub const DEFAULT_HIGH_WATERMARK: usize = 4 * 1024 * 1024;

/// Default low watermark at which sending resumes (64 KiB)
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;

/// Poll interval used when the channel cannot signal a drain
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transfer tuning
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Descriptive frame sent ahead of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: content_type.into(),
        }
    }
}

/// Sender progress after a chunk was handed to the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_sent: u64,
    pub total: u64,
}

impl Progress {
    /// Fraction in `0.0..=1.0`; an empty file counts as complete
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total as f64
        }
    }

    /// Rounded percentage
    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total
    }
}

/// Human-readable size (B, KB, MB)
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

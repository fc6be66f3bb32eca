use thiserror::Error;

pub mod bosses;
pub mod flag_index;
pub mod handler;
pub mod journal;
pub mod monitor;
pub mod save_file;

pub use bosses::BossCatalog;
pub use flag_index::{BlockMap, FlagAddress};
pub use handler::{DecoderKind, ExternalHandler, HybridHandler, NativeHandler, SaveHandler};
pub use journal::KillJournal;
pub use monitor::{MonitorConfig, MonitorEvent, SaveMonitor};
pub use save_file::{CharacterSlot, CharacterStats, FullStatus, SaveArchive};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("save file not found: {0}")]
    FileNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file too small to be a valid save file ({size} bytes)")]
    TooSmall { size: usize },
    #[error("corrupted or unsupported save format: {0}")]
    CorruptFormat(String),
    #[error("offset {offset:#x} out of bounds (save data is {len} bytes)")]
    OutOfBounds { offset: usize, len: usize },
    #[error("event ID {event_id} not found in flag map (block {block})")]
    UnmappedBlock { event_id: u32, block: u32 },
    #[error("no characters found in save file; it may be corrupted or in an unsupported format")]
    NoCharactersFound,
    #[error("all event flag queries failed: {0}")]
    FlagQueriesFailed(String),
    #[error("external decoder not found at {0}")]
    ExternalDecoderUnavailable(String),
    #[error("external decoder ({op}) took too long to respond ({secs}s)")]
    ExternalDecoderTimeout { op: String, secs: u64 },
    #[error("external decoder failed ({op}): {message}")]
    ExternalDecoder { op: String, message: String },
    #[error("network error fetching flag block map: {0}")]
    Network(String),
    #[error("both decoders failed; primary: {primary}; secondary: {secondary}")]
    BothDecodersFailed { primary: String, secondary: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

use log::{debug, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::flag_index::{self, BlockMap};
use crate::save_file::{CharacterSlot, FullStatus, SaveArchive};
use crate::{Result, TrackerError};

const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Decode operations the fallback chain composes. Implemented by the
/// in-process decoder and by the external extractor subprocess.
pub trait SaveHandler: Send {
    fn list_characters(&mut self, save_path: &Path) -> Result<Vec<CharacterSlot>>;

    fn get_full_status(
        &mut self,
        save_path: &Path,
        slot_index: u8,
        event_ids: &[u32],
    ) -> Result<FullStatus>;
}

/// In-process decoder. Re-reads the save file on every call: the file is
/// live while the game runs, so each call is its own decode session.
pub struct NativeHandler {
    block_map: Arc<BlockMap>,
}

impl NativeHandler {
    pub fn new() -> Self {
        NativeHandler {
            block_map: flag_index::shared(),
        }
    }

    pub fn with_block_map(block_map: Arc<BlockMap>) -> Self {
        NativeHandler { block_map }
    }
}

impl Default for NativeHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SaveHandler for NativeHandler {
    fn list_characters(&mut self, save_path: &Path) -> Result<Vec<CharacterSlot>> {
        SaveArchive::load(save_path)?.list_characters()
    }

    fn get_full_status(
        &mut self,
        save_path: &Path,
        slot_index: u8,
        event_ids: &[u32],
    ) -> Result<FullStatus> {
        SaveArchive::load(save_path)?.get_full_status(slot_index, event_ids, &self.block_map)
    }
}

/// Decoder backed by the extractor CLI in a subprocess.
///
/// Both operations print JSON on stdout and are bounded by a 10s timeout;
/// a timed-out child is left to finish on its own and its output discarded.
pub struct ExternalHandler {
    cli_path: PathBuf,
    timeout: Duration,
}

impl ExternalHandler {
    pub fn new(cli_path: PathBuf) -> Self {
        ExternalHandler {
            cli_path,
            timeout: EXTERNAL_TIMEOUT,
        }
    }

    pub fn with_timeout(cli_path: PathBuf, timeout: Duration) -> Self {
        ExternalHandler { cli_path, timeout }
    }

    pub fn is_available(&self) -> bool {
        self.cli_path.exists()
    }

    fn run(&self, op: &str, args: Vec<String>) -> Result<String> {
        if !self.is_available() {
            return Err(TrackerError::ExternalDecoderUnavailable(
                self.cli_path.display().to_string(),
            ));
        }

        let cli_path = self.cli_path.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(Command::new(&cli_path).args(&args).output());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let message: String = stderr.chars().take(250).collect();
                    return Err(TrackerError::ExternalDecoder {
                        op: op.to_string(),
                        message,
                    });
                }
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Err(e)) => Err(TrackerError::ExternalDecoder {
                op: op.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(TrackerError::ExternalDecoderTimeout {
                op: op.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

impl SaveHandler for ExternalHandler {
    fn list_characters(&mut self, save_path: &Path) -> Result<Vec<CharacterSlot>> {
        let stdout = self.run(
            "list-characters",
            vec![
                "list-characters".to_string(),
                "--save-file-path".to_string(),
                save_path.display().to_string(),
            ],
        )?;
        Ok(serde_json::from_str(&stdout)?)
    }

    fn get_full_status(
        &mut self,
        save_path: &Path,
        slot_index: u8,
        event_ids: &[u32],
    ) -> Result<FullStatus> {
        let ids = event_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let stdout = self.run(
            "get-full-status",
            vec![
                "get-full-status".to_string(),
                "--save-file-path".to_string(),
                save_path.display().to_string(),
                "--slot-index".to_string(),
                slot_index.to_string(),
                "--event-ids".to_string(),
                ids,
            ],
        )?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

/// Which decoder satisfied the most recent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Primary,
    Secondary,
    None,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderKind::Primary => write!(f, "primary"),
            DecoderKind::Secondary => write!(f, "secondary"),
            DecoderKind::None => write!(f, "none"),
        }
    }
}

/// Primary-then-secondary decoder chain.
///
/// The primary's answer is accepted when it is error-free and, for
/// `list_characters`, non-empty. Otherwise the secondary is consulted when
/// fallback is enabled and its answer returned; both failing yields one
/// combined error.
pub struct HybridHandler {
    primary: Box<dyn SaveHandler>,
    secondary: Box<dyn SaveHandler>,
    fallback_enabled: bool,
    last_used: DecoderKind,
}

impl HybridHandler {
    pub fn new(primary: Box<dyn SaveHandler>, secondary: Box<dyn SaveHandler>) -> Self {
        HybridHandler {
            primary,
            secondary,
            fallback_enabled: true,
            last_used: DecoderKind::None,
        }
    }

    pub fn last_used(&self) -> DecoderKind {
        self.last_used
    }

    pub fn set_fallback_enabled(&mut self, enabled: bool) {
        self.fallback_enabled = enabled;
        debug!("secondary decoder fallback enabled: {}", enabled);
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    fn fall_back<T>(
        &mut self,
        primary_err: TrackerError,
        run_secondary: impl FnOnce(&mut dyn SaveHandler) -> Result<T>,
    ) -> Result<T> {
        warn!("primary decoder rejected: {}", primary_err);

        if !self.fallback_enabled {
            self.last_used = DecoderKind::None;
            return Err(primary_err);
        }

        match run_secondary(self.secondary.as_mut()) {
            Ok(value) => {
                self.last_used = DecoderKind::Secondary;
                Ok(value)
            }
            Err(secondary_err) => {
                self.last_used = DecoderKind::None;
                Err(TrackerError::BothDecodersFailed {
                    primary: primary_err.to_string(),
                    secondary: secondary_err.to_string(),
                })
            }
        }
    }
}

impl SaveHandler for HybridHandler {
    fn list_characters(&mut self, save_path: &Path) -> Result<Vec<CharacterSlot>> {
        let primary_err = match self.primary.list_characters(save_path) {
            Ok(slots) if !slots.is_empty() => {
                self.last_used = DecoderKind::Primary;
                return Ok(slots);
            }
            // An empty listing is a rejection: the save may use a layout the
            // in-process decoder cannot read.
            Ok(_) => TrackerError::NoCharactersFound,
            Err(e) => e,
        };

        self.fall_back(primary_err, |secondary| {
            secondary.list_characters(save_path)
        })
    }

    fn get_full_status(
        &mut self,
        save_path: &Path,
        slot_index: u8,
        event_ids: &[u32],
    ) -> Result<FullStatus> {
        let primary_err = match self.primary.get_full_status(save_path, slot_index, event_ids) {
            Ok(status) => {
                self.last_used = DecoderKind::Primary;
                return Ok(status);
            }
            Err(e) => e,
        };

        self.fall_back(primary_err, |secondary| {
            secondary.get_full_status(save_path, slot_index, event_ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save_file::CharacterStats;
    use std::collections::BTreeMap;

    struct FakeHandler {
        characters: Result<Vec<CharacterSlot>>,
        status: Result<FullStatus>,
    }

    impl FakeHandler {
        fn listing(characters: Result<Vec<CharacterSlot>>) -> Self {
            FakeHandler {
                characters,
                status: Ok(empty_status()),
            }
        }
    }

    impl SaveHandler for FakeHandler {
        fn list_characters(&mut self, _save_path: &Path) -> Result<Vec<CharacterSlot>> {
            match &self.characters {
                Ok(slots) => Ok(slots.clone()),
                Err(e) => Err(TrackerError::CorruptFormat(e.to_string())),
            }
        }

        fn get_full_status(
            &mut self,
            _save_path: &Path,
            _slot_index: u8,
            _event_ids: &[u32],
        ) -> Result<FullStatus> {
            match &self.status {
                Ok(status) => Ok(status.clone()),
                Err(e) => Err(TrackerError::CorruptFormat(e.to_string())),
            }
        }
    }

    fn empty_status() -> FullStatus {
        FullStatus {
            stats: CharacterStats::default(),
            boss_statuses: BTreeMap::new(),
        }
    }

    fn slot(name: &str) -> CharacterSlot {
        CharacterSlot {
            slot_index: 0,
            character_name: name.to_string(),
            character_level: 10,
            seconds_played: 100,
        }
    }

    #[test]
    fn primary_wins_when_non_empty() {
        let primary = FakeHandler::listing(Ok(vec![slot("Primary")]));
        let secondary = FakeHandler::listing(Ok(vec![slot("Secondary")]));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));

        let slots = hybrid.list_characters(Path::new("save.sl2")).unwrap();
        assert_eq!(slots[0].character_name, "Primary");
        assert_eq!(hybrid.last_used(), DecoderKind::Primary);
    }

    #[test]
    fn empty_primary_listing_falls_back() {
        let primary = FakeHandler::listing(Ok(Vec::new()));
        let secondary = FakeHandler::listing(Ok(vec![slot("Secondary")]));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));

        let slots = hybrid.list_characters(Path::new("save.sl2")).unwrap();
        assert_eq!(slots[0].character_name, "Secondary");
        assert_eq!(hybrid.last_used(), DecoderKind::Secondary);
    }

    #[test]
    fn primary_error_falls_back() {
        let primary = FakeHandler::listing(Err(TrackerError::NoCharactersFound));
        let secondary = FakeHandler::listing(Ok(vec![slot("Secondary")]));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));

        let slots = hybrid.list_characters(Path::new("save.sl2")).unwrap();
        assert_eq!(slots[0].character_name, "Secondary");
        assert_eq!(hybrid.last_used(), DecoderKind::Secondary);
    }

    #[test]
    fn both_failing_is_a_combined_error() {
        let primary = FakeHandler::listing(Err(TrackerError::NoCharactersFound));
        let secondary = FakeHandler::listing(Err(TrackerError::NoCharactersFound));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));

        let err = hybrid.list_characters(Path::new("save.sl2")).unwrap_err();
        assert!(matches!(err, TrackerError::BothDecodersFailed { .. }));
        assert_eq!(hybrid.last_used(), DecoderKind::None);
    }

    #[test]
    fn disabled_fallback_returns_primary_error() {
        let primary = FakeHandler::listing(Err(TrackerError::NoCharactersFound));
        let secondary = FakeHandler::listing(Ok(vec![slot("Secondary")]));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));
        hybrid.set_fallback_enabled(false);

        let err = hybrid.list_characters(Path::new("save.sl2")).unwrap_err();
        assert!(matches!(err, TrackerError::CorruptFormat(_)));
        assert_eq!(hybrid.last_used(), DecoderKind::None);
    }

    #[test]
    fn full_status_accepts_primary_without_emptiness_rule() {
        let primary = FakeHandler::listing(Ok(Vec::new()));
        let secondary = FakeHandler::listing(Ok(vec![slot("Secondary")]));
        let mut hybrid = HybridHandler::new(Box::new(primary), Box::new(secondary));

        // Empty boss map from the primary is still a success for status.
        let status = hybrid
            .get_full_status(Path::new("save.sl2"), 0, &[100])
            .unwrap();
        assert!(status.boss_statuses.is_empty());
        assert_eq!(hybrid.last_used(), DecoderKind::Primary);
    }

    #[test]
    fn missing_external_binary_is_unavailable() {
        let mut handler = ExternalHandler::new(PathBuf::from("/nonexistent/flag-extractor"));
        let err = handler.list_characters(Path::new("save.sl2")).unwrap_err();
        assert!(matches!(err, TrackerError::ExternalDecoderUnavailable(_)));
    }
}

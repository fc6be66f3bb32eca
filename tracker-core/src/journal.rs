use log::{info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::Result;

const JOURNAL_FILE_NAME: &str = "timestamps.json";

/// Append-only ledger of first-kill timestamps, keyed by character and
/// event ID.
///
/// The first write for a `(character, event)` pair wins; later writes are
/// no-ops, so re-scans and repeated monitoring cycles cannot move a recorded
/// kill time. Every insert rewrites the whole file (the dataset is tens to
/// low hundreds of entries).
pub struct KillJournal {
    path: PathBuf,
    timestamps: BTreeMap<String, BTreeMap<String, u32>>,
}

impl KillJournal {
    /// Default journal location under the user's home directory.
    pub fn default_path() -> Option<PathBuf> {
        let mut base = dirs::home_dir()?;
        base.push(".save-tracker");
        base.push(JOURNAL_FILE_NAME);
        Some(base)
    }

    /// Opens a journal at `path`, loading existing records. A missing or
    /// unreadable file starts an empty ledger rather than failing.
    pub fn open(path: PathBuf) -> Self {
        let timestamps = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!("ignoring corrupt journal at {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        KillJournal { path, timestamps }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Records the play-time of a first kill. Existing records are never
    /// overwritten; only a fresh insert persists the ledger.
    pub fn add_timestamp(
        &mut self,
        character_id: &str,
        event_id: u32,
        play_seconds: u32,
    ) -> Result<()> {
        let per_character = self.timestamps.entry(character_id.to_string()).or_default();
        let key = event_id.to_string();
        if per_character.contains_key(&key) {
            return Ok(());
        }

        info!(
            "recording kill for event {} at {}s for character '{}'",
            event_id, play_seconds, character_id
        );
        per_character.insert(key, play_seconds);
        self.save()
    }

    pub fn get_timestamps_for_character(&self, character_id: &str) -> BTreeMap<u32, u32> {
        self.timestamps
            .get(character_id)
            .map(|per_character| {
                per_character
                    .iter()
                    .filter_map(|(id, &seconds)| id.parse().ok().map(|id| (id, seconds)))
                    .collect()
            })
            .unwrap_or_default()
    }

    // Whole-file rewrite through a temp file so a crash mid-write leaves
    // either the old ledger or the new one, never a torn file.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(serde_json::to_string_pretty(&self.timestamps)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::flag_index::BlockMap;
use crate::{Result, TrackerError};

// PC save layout. The file opens with a checksum/magic header, followed by
// up to 10 fixed-size character slots. Each slot carries its own event-flag
// region at a fixed interior offset.
pub const SAVE_HEADER_SIZE: usize = 0x30C;
pub const SLOT_BASE: usize = 0x310;
pub const SLOT_SIZE: usize = 0x28_0010;
pub const EVENT_FLAGS_SLOT_OFFSET: usize = 0x3_89F8;
pub const MAX_SLOTS: u8 = 10;

// The profile summary table lives at a fixed, slot-independent position.
// Its entries are NOT inside the slot regions; slot addressing and
// profile-table addressing must never be mixed.
pub const PROFILE_SUMMARY_BASE: usize = 0x190_1D00;
pub const PROFILE_ENTRY_SIZE: usize = 0x24C;
const PROFILE_NAME_OFFSET: usize = 0x0E;
const PROFILE_LEVEL_OFFSET: usize = 0x30;
const PROFILE_PLAYTIME_OFFSET: usize = 0x34;

// Name field is UTF-16LE, at most 32 bytes.
const NAME_MAX_CHARS: usize = 16;

/// One occupied character slot, as read from the profile summary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSlot {
    pub slot_index: u8,
    pub character_name: String,
    pub character_level: u32,
    pub seconds_played: u32,
}

/// Per-character stats block of the decoded status payload.
///
/// The profile table has no deaths counter; the field is kept for the wire
/// contract and fixed at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterStats {
    pub character_name: String,
    pub level: u32,
    pub seconds_played: u32,
    pub deaths: u32,
}

impl Default for CharacterStats {
    fn default() -> Self {
        CharacterStats {
            character_name: String::new(),
            level: 1,
            seconds_played: 0,
            deaths: 0,
        }
    }
}

/// Decoded snapshot for one character: stats plus a flag map keyed by the
/// event ID's decimal string.
///
/// `BTreeMap` keeps comparison canonical: two snapshots built in different
/// insertion orders are equal when their contents are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStatus {
    pub stats: CharacterStats,
    pub boss_statuses: BTreeMap<String, bool>,
}

/// Immutable save-file buffer with decode operations.
///
/// Each archive is one decode session over one read of the file; a monitor
/// re-loads the path every tick to observe live changes.
#[derive(Debug)]
pub struct SaveArchive {
    data: Vec<u8>,
    bnd4: bool,
}

impl SaveArchive {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TrackerError::FileNotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                TrackerError::PermissionDenied(path.display().to_string())
            }
            _ => TrackerError::Io(e),
        })?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < SAVE_HEADER_SIZE {
            return Err(TrackerError::TooSmall { size: data.len() });
        }
        // Magic sniff only; decrypted saves may legitimately lack it.
        let bnd4 = data.len() >= 4 && &data[..4] == b"BND4";
        Ok(SaveArchive { data, bnd4 })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_bnd4(&self) -> bool {
        self.bnd4
    }

    /// Byte offset of a character slot region.
    pub fn slot_offset(slot_index: u8) -> usize {
        SLOT_BASE + slot_index as usize * SLOT_SIZE
    }

    /// Base of the event-flag region inside a slot, bounds-checked against
    /// the buffer.
    fn event_flags_base(&self, slot_index: u8) -> Result<usize> {
        let base = Self::slot_offset(slot_index) + EVENT_FLAGS_SLOT_OFFSET;
        if base >= self.data.len() {
            return Err(TrackerError::OutOfBounds {
                offset: base,
                len: self.data.len(),
            });
        }
        Ok(base)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        match self.data.get(offset..offset + 4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    /// Null-terminated UTF-16LE string, at most `max_chars` code units.
    fn read_utf16(&self, offset: usize, max_chars: usize) -> String {
        let mut units = Vec::with_capacity(max_chars);
        for i in 0..max_chars {
            let base = offset + i * 2;
            let Some(bytes) = self.data.get(base..base + 2) else {
                break;
            };
            let unit = u16::from_le_bytes([bytes[0], bytes[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16_lossy(&units)
    }

    /// Scans the profile summary table for occupied slots.
    ///
    /// Empty-name entries are skipped, not errors; the scan stops at the
    /// first entry that would run past the buffer. A scan with zero
    /// survivors is `NoCharactersFound`.
    pub fn list_characters(&self) -> Result<Vec<CharacterSlot>> {
        let mut characters = Vec::new();

        for slot_index in 0..MAX_SLOTS {
            let entry_offset = PROFILE_SUMMARY_BASE + slot_index as usize * PROFILE_ENTRY_SIZE;
            if entry_offset + PROFILE_ENTRY_SIZE > self.data.len() {
                break;
            }

            let name = self.read_utf16(entry_offset + PROFILE_NAME_OFFSET, NAME_MAX_CHARS);
            if name.is_empty() {
                continue;
            }

            characters.push(CharacterSlot {
                slot_index,
                character_name: name,
                character_level: self.read_u32(entry_offset + PROFILE_LEVEL_OFFSET),
                seconds_played: self.read_u32(entry_offset + PROFILE_PLAYTIME_OFFSET),
            });
        }

        if characters.is_empty() {
            return Err(TrackerError::NoCharactersFound);
        }
        Ok(characters)
    }

    /// Reads a single event flag for a slot.
    pub fn get_event_flag(
        &self,
        slot_index: u8,
        event_id: u32,
        block_map: &BlockMap,
    ) -> Result<bool> {
        let address = block_map.resolve(event_id)?;
        let region_base = self.event_flags_base(slot_index)?;
        let byte_offset = region_base + address.byte_offset;

        let Some(&byte) = self.data.get(byte_offset) else {
            return Err(TrackerError::OutOfBounds {
                offset: byte_offset,
                len: self.data.len(),
            });
        };

        Ok((byte >> address.bit_index) & 1 == 1)
    }

    /// Profile-table stats for one slot.
    pub fn get_character_stats(&self, slot_index: u8) -> Result<CharacterStats> {
        let entry_offset = PROFILE_SUMMARY_BASE + slot_index as usize * PROFILE_ENTRY_SIZE;
        if entry_offset + PROFILE_ENTRY_SIZE > self.data.len() {
            return Err(TrackerError::OutOfBounds {
                offset: entry_offset,
                len: self.data.len(),
            });
        }

        Ok(CharacterStats {
            character_name: self.read_utf16(entry_offset + PROFILE_NAME_OFFSET, NAME_MAX_CHARS),
            level: self.read_u32(entry_offset + PROFILE_LEVEL_OFFSET),
            seconds_played: self.read_u32(entry_offset + PROFILE_PLAYTIME_OFFSET),
            deaths: 0,
        })
    }

    /// Combined stats and flag batch for one slot.
    ///
    /// Stats are best-effort and degrade to defaults. Individual flag
    /// failures degrade that entry to `false`; only every query failing
    /// fails the call.
    pub fn get_full_status(
        &self,
        slot_index: u8,
        event_ids: &[u32],
        block_map: &BlockMap,
    ) -> Result<FullStatus> {
        let stats = self.get_character_stats(slot_index).unwrap_or_else(|e| {
            debug!("stats read failed for slot {}: {}", slot_index, e);
            CharacterStats::default()
        });

        let mut boss_statuses = BTreeMap::new();
        let mut errors = Vec::new();
        for &event_id in event_ids {
            match self.get_event_flag(slot_index, event_id, block_map) {
                Ok(value) => {
                    boss_statuses.insert(event_id.to_string(), value);
                }
                Err(e) => {
                    errors.push(format!("event {}: {}", event_id, e));
                    boss_statuses.insert(event_id.to_string(), false);
                }
            }
        }

        if !event_ids.is_empty() && errors.len() == event_ids.len() {
            errors.truncate(3);
            return Err(TrackerError::FlagQueriesFailed(errors.join("; ")));
        }

        Ok(FullStatus {
            stats,
            boss_statuses,
        })
    }
}

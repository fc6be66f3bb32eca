use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Result, TrackerError};

// Event flags are grouped into blocks of 1000 IDs. The block map translates
// a block number into an offset multiplier inside the per-slot flag region;
// the region stride per mapped block is 125 bytes (1000 bits).
pub const FLAG_DIVISOR: u32 = 1000;
pub const BLOCK_STRIDE: usize = 125;

const BLOCK_MAP_URL: &str =
    "https://raw.githubusercontent.com/ClayAmore/ER-Save-Lib/master/src/res/eventflag_bst.txt";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);
const CACHE_FILE_NAME: &str = "eventflag_bst.txt";

/// Byte/bit position of one event flag, relative to a slot's flag region.
///
/// The caller adds the per-slot region base to `byte_offset`; the flag is
/// `(byte >> bit_index) & 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagAddress {
    pub byte_offset: usize,
    pub bit_index: u32,
}

/// Sparse mapping from flag block number to its offset multiplier.
///
/// Immutable after construction. An empty map is a valid degraded state:
/// every resolve fails with `UnmappedBlock` and callers degrade gracefully.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    blocks: HashMap<u32, u32>,
}

impl BlockMap {
    pub fn new(blocks: HashMap<u32, u32>) -> Self {
        BlockMap { blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Parses the `"<blockId>,<offset>"` line format. Malformed lines are
    /// skipped rather than failing the whole load.
    pub fn parse(text: &str) -> Self {
        let mut blocks = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            let Some((block, offset)) = line.split_once(',') else {
                continue;
            };
            match (block.trim().parse::<u32>(), offset.trim().parse::<u32>()) {
                (Ok(block), Ok(offset)) => {
                    blocks.insert(block, offset);
                }
                _ => continue,
            }
        }
        BlockMap { blocks }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Resolves an event ID into a byte/bit address inside the flag region.
    pub fn resolve(&self, event_id: u32) -> Result<FlagAddress> {
        let block = event_id / FLAG_DIVISOR;
        let local = event_id % FLAG_DIVISOR;

        let Some(&multiplier) = self.blocks.get(&block) else {
            return Err(TrackerError::UnmappedBlock { event_id, block });
        };

        let byte_index = (local / 8) as usize;
        let bit_index = 7 - (local % 8);

        Ok(FlagAddress {
            byte_offset: multiplier as usize * BLOCK_STRIDE + byte_index,
            bit_index,
        })
    }
}

fn download_block_map() -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| TrackerError::Network(e.to_string()))?;
    let response = client
        .get(BLOCK_MAP_URL)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| TrackerError::Network(e.to_string()))?;
    response
        .text()
        .map_err(|e| TrackerError::Network(e.to_string()))
}

/// Default location of the cached block-map file.
pub fn default_cache_path() -> Option<PathBuf> {
    let mut base = dirs::home_dir()?;
    base.push(".save-tracker");
    base.push(CACHE_FILE_NAME);
    Some(base)
}

/// Loads the block map: local cache first, then a bounded download that is
/// persisted back to the cache. Both failing yields an empty map so callers
/// keep running with flag queries disabled.
pub fn load_block_map(cache_path: Option<&Path>) -> BlockMap {
    if let Some(path) = cache_path {
        if path.exists() {
            match BlockMap::from_file(path) {
                Ok(map) if !map.is_empty() => {
                    info!("loaded flag block map from cache ({} blocks)", map.len());
                    return map;
                }
                Ok(_) => warn!("cached flag block map at {:?} is empty", path),
                Err(e) => warn!("failed to read cached flag block map: {}", e),
            }
        }
    }

    match download_block_map() {
        Ok(text) => {
            let map = BlockMap::parse(&text);
            info!("downloaded flag block map ({} blocks)", map.len());
            if let Some(path) = cache_path {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(path, &text) {
                    warn!("failed to cache flag block map at {:?}: {}", path, e);
                }
            }
            map
        }
        Err(e) => {
            warn!("{}; boss tracking disabled until the map is available", e);
            BlockMap::default()
        }
    }
}

static SHARED: Mutex<Option<Arc<BlockMap>>> = Mutex::new(None);

/// Process-wide block map, loaded lazily at most once.
///
/// The load may hit the network; use `init_with` in tests to bypass it.
pub fn shared() -> Arc<BlockMap> {
    let mut guard = SHARED.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(map) = guard.as_ref() {
        return Arc::clone(map);
    }
    let map = Arc::new(load_block_map(default_cache_path().as_deref()));
    *guard = Some(Arc::clone(&map));
    map
}

/// Installs a block map as the process-wide instance, replacing any
/// previously loaded one.
pub fn init_with(map: BlockMap) -> Arc<BlockMap> {
    let map = Arc::new(map);
    let mut guard = SHARED.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(Arc::clone(&map));
    map
}

/// Clears the process-wide instance so the next `shared()` reloads.
pub fn reset() {
    let mut guard = SHARED.lock().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> BlockMap {
        let mut blocks = HashMap::new();
        blocks.insert(10, 4);
        blocks.insert(105, 0);
        BlockMap::new(blocks)
    }

    #[test]
    fn resolves_block_and_bit() {
        let map = sample_map();
        // 10123: block 10, local 123 -> byte 15, bit 7 - 3 = 4.
        let addr = map.resolve(10123).unwrap();
        assert_eq!(addr.byte_offset, 4 * BLOCK_STRIDE + 15);
        assert_eq!(addr.bit_index, 4);
    }

    #[test]
    fn resolves_block_zero_offset() {
        let map = sample_map();
        // 105000: block 105 maps to multiplier 0, local 0 -> byte 0, bit 7.
        let addr = map.resolve(105_000).unwrap();
        assert_eq!(addr.byte_offset, 0);
        assert_eq!(addr.bit_index, 7);
    }

    #[test]
    fn unmapped_block_is_an_error_not_false() {
        let map = sample_map();
        let err = map.resolve(99_001).unwrap_err();
        match err {
            TrackerError::UnmappedBlock { event_id, block } => {
                assert_eq!(event_id, 99_001);
                assert_eq!(block, 99);
            }
            other => panic!("expected UnmappedBlock, got {other:?}"),
        }
    }

    #[test]
    fn parses_cache_file_lines() {
        let map = BlockMap::parse("0,0\n10,4\nnot-a-line\n20,\n30,7\n");
        assert_eq!(map.len(), 3);
        assert_eq!(map.resolve(30_000).unwrap().byte_offset, 7 * BLOCK_STRIDE);
    }

    #[test]
    fn empty_map_fails_every_resolve() {
        let map = BlockMap::default();
        assert!(map.is_empty());
        assert!(matches!(
            map.resolve(10_000),
            Err(TrackerError::UnmappedBlock { .. })
        ));
    }

    #[test]
    fn init_with_replaces_shared_instance() {
        let installed = init_with(sample_map());
        let seen = shared();
        assert_eq!(seen.len(), installed.len());
        reset();
    }
}

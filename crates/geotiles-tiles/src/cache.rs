//! Memory-budgeted cache of loaded tiles.
//!
//! Tracks the byte size of every loaded renderable tile and evicts the least
//! recently selected ones once the total exceeds the budget. Tiles selected
//! in the current frame are never evicted, so the cache may stay over budget
//! when the visible set alone is larger than the budget.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::tile::TileId;

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    byte_size: u64,
    last_selected: Option<u64>,
    seq: u64,
}

impl CacheEntry {
    fn key(&self, id: TileId) -> (Option<u64>, u64, TileId) {
        (self.last_selected, self.seq, id)
    }
}

/// Result of a trim pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrimOutcome {
    /// Evicted tiles, least recently selected first.
    pub evicted: Vec<TileId>,
    pub freed_bytes: u64,
    /// Still over budget after evicting everything eligible.
    pub over_budget: bool,
}

/// Byte accounting and LRU ordering of loaded tiles.
#[derive(Debug, Default)]
pub struct TileCache {
    entries: FxHashMap<TileId, CacheEntry>,
    /// Eviction order: never-selected first, then by selection frame, then
    /// insertion order.
    order: BTreeSet<(Option<u64>, u64, TileId)>,
    total_bytes: u64,
    next_seq: u64,
}

impl TileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tile. Inserting a tile that is already cached does nothing.
    pub fn insert(&mut self, id: TileId, byte_size: u64, last_selected: Option<u64>) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        let entry = CacheEntry {
            byte_size,
            last_selected,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.order.insert(entry.key(id));
        self.entries.insert(id, entry);
        self.total_bytes += byte_size;
        true
    }

    /// Records that `id` was selected in `frame`.
    pub fn mark_used(&mut self, id: TileId, frame: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        self.order.remove(&entry.key(id));
        entry.last_selected = Some(frame);
        self.order.insert(entry.key(id));
        true
    }

    /// Forgets a tile without triggering eviction callbacks. Returns its size.
    pub fn remove(&mut self, id: TileId) -> Option<u64> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.key(id));
        self.total_bytes -= entry.byte_size;
        Some(entry.byte_size)
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts least-recently-selected tiles until the total fits in
    /// `budget`. Tiles selected in `current_frame` are exempt. `on_evict`
    /// runs once per evicted tile, in eviction order.
    pub fn trim(
        &mut self,
        budget: u64,
        current_frame: u64,
        mut on_evict: impl FnMut(TileId),
    ) -> TrimOutcome {
        let mut outcome = TrimOutcome::default();
        if self.total_bytes <= budget {
            return outcome;
        }

        let mut remaining = self.total_bytes;
        for &(last_selected, _, id) in &self.order {
            if remaining <= budget {
                break;
            }
            if last_selected == Some(current_frame) {
                continue;
            }
            if let Some(entry) = self.entries.get(&id) {
                remaining -= entry.byte_size;
                outcome.evicted.push(id);
            }
        }

        for &id in &outcome.evicted {
            if let Some(bytes) = self.remove(id) {
                outcome.freed_bytes += bytes;
            }
            on_evict(id);
        }

        outcome.over_budget = self.total_bytes > budget;
        if outcome.over_budget {
            debug!(
                total = self.total_bytes,
                budget, "Tile cache over budget with only visible tiles left"
            );
        }
        outcome
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}

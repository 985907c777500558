//! Fixed-width packed array of small integers.
//!
//! Each subtask index stores one small value (a phase code or a retry count)
//! in `item_size` bits. The array never grows or shrinks after creation.

use serde::{Deserialize, Serialize};

const BLOCK_BITS: usize = u64::BITS as usize;

/// Dense, index-addressable store of fixed-width unsigned values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawCompactArray")]
pub struct CompactArray {
    item_size: u32,
    items_count: usize,
    blocks: Vec<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCompactArray {
    item_size: u32,
    items_count: usize,
    blocks: Vec<u64>,
}

impl TryFrom<RawCompactArray> for CompactArray {
    type Error = String;

    fn try_from(raw: RawCompactArray) -> Result<Self, Self::Error> {
        if raw.items_count > 0 && (raw.item_size == 0 || raw.item_size > u64::BITS) {
            return Err(format!("invalid item size {}", raw.item_size));
        }
        let expected = blocks_for(raw.items_count, raw.item_size);
        if raw.blocks.len() != expected {
            return Err(format!(
                "compact array of {} items needs {expected} blocks, found {}",
                raw.items_count,
                raw.blocks.len()
            ));
        }
        Ok(Self {
            item_size: raw.item_size,
            items_count: raw.items_count,
            blocks: raw.blocks,
        })
    }
}

fn bits_for(max_value: u64) -> u32 {
    (u64::BITS - max_value.leading_zeros()).max(1)
}

fn blocks_for(items_count: usize, item_size: u32) -> usize {
    (items_count * item_size as usize).div_ceil(BLOCK_BITS)
}

impl CompactArray {
    /// Creates an array of `items_count` zeros, wide enough to hold `max_value`.
    #[must_use]
    pub fn new(items_count: usize, max_value: u64) -> Self {
        let item_size = bits_for(max_value);
        Self {
            item_size,
            items_count,
            blocks: vec![0; blocks_for(items_count, item_size)],
        }
    }

    /// Returns the number of items.
    #[must_use]
    pub const fn items_count(&self) -> usize {
        self.items_count
    }

    /// Returns true if the array holds no items.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items_count == 0
    }

    /// Returns the width of each item in bits.
    #[must_use]
    pub const fn item_size(&self) -> u32 {
        self.item_size
    }

    /// Returns the largest value an item can hold.
    #[must_use]
    pub const fn max_value(&self) -> u64 {
        if self.item_size >= u64::BITS {
            u64::MAX
        } else {
            (1 << self.item_size) - 1
        }
    }

    /// Returns the value at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= items_count`.
    #[must_use]
    pub fn get_item(&self, index: usize) -> u64 {
        self.check_index(index);
        let base = index * self.item_size as usize;
        (0..self.item_size as usize).fold(0, |acc, bit| {
            let pos = base + bit;
            let set = (self.blocks[pos / BLOCK_BITS] >> (pos % BLOCK_BITS)) & 1;
            acc | (set << bit)
        })
    }

    /// Stores `value` at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= items_count` or `value` does not fit in `item_size` bits.
    pub fn set_item(&mut self, index: usize, value: u64) {
        self.check_index(index);
        assert!(
            value <= self.max_value(),
            "value {value} does not fit in {} bits",
            self.item_size
        );
        let base = index * self.item_size as usize;
        for bit in 0..self.item_size as usize {
            let pos = base + bit;
            let mask = 1u64 << (pos % BLOCK_BITS);
            let block = &mut self.blocks[pos / BLOCK_BITS];
            if (value >> bit) & 1 == 1 {
                *block |= mask;
            } else {
                *block &= !mask;
            }
        }
    }

    /// Returns every item in index order.
    #[must_use]
    pub fn get_items(&self) -> Vec<u64> {
        (0..self.items_count).map(|i| self.get_item(i)).collect()
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.items_count,
            "index {index} out of range for compact array of {} items",
            self.items_count
        );
    }
}

//! Block-range → storage-key lookup table
//!
//! The source chain changed where it stores lock events over time, so the
//! key to prove depends on the block. The table is validated once at load
//! time; a lookup outside every range is a hard error.

use alloy::primitives::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageKeyError;
use crate::hash::parse_hex_bytes;

/// One configured range. `max_block: None` leaves the range open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKeyRange {
    pub min_block: u64,
    #[serde(default)]
    pub max_block: Option<u64>,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    min_block: u64,
    max_block: Option<u64>,
    key: Bytes,
}

impl Entry {
    fn contains(&self, block: u64) -> bool {
        block >= self.min_block && self.max_block.map_or(true, |max| block <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeyTable {
    entries: Vec<Entry>,
}

impl StorageKeyTable {
    /// Validate and sort `ranges`. Overlaps are always rejected; gaps only
    /// when `allow_gaps` is false.
    pub fn new(ranges: Vec<StorageKeyRange>, allow_gaps: bool) -> Result<Self, StorageKeyError> {
        if ranges.is_empty() {
            return Err(StorageKeyError::NoRanges);
        }

        let mut entries = ranges
            .into_iter()
            .map(|range| {
                if let Some(max) = range.max_block {
                    if range.min_block > max {
                        return Err(StorageKeyError::EmptyRange {
                            min: range.min_block,
                            max,
                        });
                    }
                }
                let key = parse_hex_bytes(&range.key).map_err(|e| StorageKeyError::InvalidKey {
                    key: range.key.clone(),
                    reason: e.to_string(),
                })?;
                if key.is_empty() {
                    return Err(StorageKeyError::InvalidKey {
                        key: range.key,
                        reason: "empty key".to_string(),
                    });
                }
                Ok(Entry {
                    min_block: range.min_block,
                    max_block: range.max_block,
                    key: Bytes::from(key),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        entries.sort_by_key(|e| e.min_block);

        for pair in entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            match prev.max_block {
                None => return Err(StorageKeyError::Overlap { block: next.min_block }),
                Some(max) if next.min_block <= max => {
                    return Err(StorageKeyError::Overlap { block: next.min_block })
                }
                Some(max) if !allow_gaps && next.min_block != max + 1 => {
                    return Err(StorageKeyError::Gap {
                        after: max,
                        next: next.min_block,
                    })
                }
                Some(_) => {}
            }
        }

        Ok(Self { entries })
    }

    /// Parse a JSON array of ranges, as carried by `BRIDGE_STORAGE_KEYS`
    pub fn from_json(json: &str, allow_gaps: bool) -> Result<Self, StorageKeyError> {
        let ranges: Vec<StorageKeyRange> =
            serde_json::from_str(json).map_err(|e| StorageKeyError::InvalidKey {
                key: json.to_string(),
                reason: e.to_string(),
            })?;
        Self::new(ranges, allow_gaps)
    }

    /// A table with one open-ended range starting at genesis
    pub fn single(key: &str) -> Result<Self, StorageKeyError> {
        Self::new(
            vec![StorageKeyRange {
                min_block: 0,
                max_block: None,
                key: key.to_string(),
            }],
            false,
        )
    }

    pub fn key_for(&self, block: u64) -> Result<Bytes, StorageKeyError> {
        let idx = self.entries.partition_point(|e| e.min_block <= block);
        idx.checked_sub(1)
            .map(|i| &self.entries[i])
            .filter(|e| e.contains(block))
            .map(|e| e.key.clone())
            .ok_or(StorageKeyError::Unmapped { block })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: u64, max: Option<u64>, key: &str) -> StorageKeyRange {
        StorageKeyRange {
            min_block: min,
            max_block: max,
            key: key.to_string(),
        }
    }

    #[test]
    fn test_lookup_selects_containing_range() {
        let table = StorageKeyTable::new(
            vec![
                range(1001, None, "0x02"),
                range(0, Some(1000), "0x01"),
            ],
            false,
        )
        .unwrap();

        assert_eq!(table.key_for(0).unwrap(), Bytes::from(vec![1u8]));
        assert_eq!(table.key_for(1000).unwrap(), Bytes::from(vec![1u8]));
        assert_eq!(table.key_for(1001).unwrap(), Bytes::from(vec![2u8]));
        assert_eq!(table.key_for(u64::MAX).unwrap(), Bytes::from(vec![2u8]));
    }

    #[test]
    fn test_unmapped_block_is_error() {
        let table = StorageKeyTable::new(vec![range(100, Some(200), "0xaa")], false).unwrap();
        assert_eq!(
            table.key_for(99),
            Err(StorageKeyError::Unmapped { block: 99 })
        );
        assert_eq!(
            table.key_for(201),
            Err(StorageKeyError::Unmapped { block: 201 })
        );
    }

    #[test]
    fn test_rejects_overlap() {
        let err = StorageKeyTable::new(
            vec![range(0, Some(100), "0x01"), range(100, None, "0x02")],
            false,
        )
        .unwrap_err();
        assert_eq!(err, StorageKeyError::Overlap { block: 100 });

        let err = StorageKeyTable::new(
            vec![range(0, None, "0x01"), range(500, Some(600), "0x02")],
            true,
        )
        .unwrap_err();
        assert_eq!(err, StorageKeyError::Overlap { block: 500 });
    }

    #[test]
    fn test_gaps_rejected_unless_allowed() {
        let ranges = vec![range(0, Some(100), "0x01"), range(200, None, "0x02")];

        let err = StorageKeyTable::new(ranges.clone(), false).unwrap_err();
        assert_eq!(err, StorageKeyError::Gap { after: 100, next: 200 });

        let table = StorageKeyTable::new(ranges, true).unwrap();
        assert_eq!(
            table.key_for(150),
            Err(StorageKeyError::Unmapped { block: 150 })
        );
    }

    #[test]
    fn test_rejects_empty_range_and_bad_key() {
        assert_eq!(
            StorageKeyTable::new(vec![range(10, Some(5), "0x01")], false).unwrap_err(),
            StorageKeyError::EmptyRange { min: 10, max: 5 }
        );
        assert!(matches!(
            StorageKeyTable::new(vec![range(0, None, "0xnothex")], false).unwrap_err(),
            StorageKeyError::InvalidKey { .. }
        ));
        assert_eq!(
            StorageKeyTable::new(vec![], false).unwrap_err(),
            StorageKeyError::NoRanges
        );
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {"min_block": 0, "max_block": 499, "key": "0xf8860dda"},
            {"min_block": 500, "key": "0xe66f3de2"}
        ]"#;
        let table = StorageKeyTable::from_json(json, false).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.key_for(800).unwrap(),
            Bytes::from(vec![0xe6, 0x6f, 0x3d, 0xe2])
        );
    }
}

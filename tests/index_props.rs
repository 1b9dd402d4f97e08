//! Property tests for the ordered address index and the code map

use proptest::prelude::*;
use std::collections::BTreeSet;

use v8lens::codemap::{CodeEntry, CodeMap};
use v8lens::splay::SplayTree;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16),
    Remove(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u16>().prop_map(|k| Op::Insert(k % 512)),
        1 => any::<u16>().prop_map(|k| Op::Remove(k % 512)),
    ]
}

proptest! {
    #[test]
    fn test_keys_stay_sorted(ops in prop::collection::vec(op(), 0..200)) {
        let mut tree = SplayTree::new();
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                Op::Insert(k) => {
                    prop_assert_eq!(tree.insert(k, u32::from(k)), model.insert(k));
                }
                Op::Remove(k) => {
                    prop_assert_eq!(tree.remove(&k).is_some(), model.remove(&k));
                }
            }
            let keys: Vec<u16> = tree.keys().copied().collect();
            let expected: Vec<u16> = model.iter().copied().collect();
            prop_assert_eq!(keys, expected);
            prop_assert_eq!(tree.len(), model.len());
        }
    }

    #[test]
    fn test_neighbor_queries(keys in prop::collection::btree_set(0u32..1000, 0..60), probe in 0u32..1100) {
        let mut tree = SplayTree::new();
        for k in &keys {
            tree.insert(*k, ());
        }
        let below = keys.range(..probe).next_back().copied();
        let above = keys.range(probe + 1..).next().copied();
        let at_or_below = keys.range(..=probe).next_back().copied();

        let found = tree.find_greatest_less_than(&probe).map(|id| *tree.key(id));
        prop_assert_eq!(found, below);
        let found = tree.find_least_greater_than(&probe).map(|id| *tree.key(id));
        prop_assert_eq!(found, above);
        let found = tree.find_greatest_less_than_or_equal(&probe).map(|id| *tree.key(id));
        prop_assert_eq!(found, at_or_below);
        let peeked = tree.peek_greatest_less_than_or_equal(&probe).map(|id| *tree.key(id));
        prop_assert_eq!(peeked, at_or_below);
    }

    #[test]
    fn test_retain_matches_filter(keys in prop::collection::btree_set(0u32..500, 0..80), modulus in 2u32..7) {
        let mut tree = SplayTree::new();
        for k in &keys {
            tree.insert(*k, *k);
        }
        tree.retain(|k, _| k % modulus != 0);
        let left: Vec<u32> = tree.keys().copied().collect();
        let expected: Vec<u32> = keys.iter().copied().filter(|k| k % modulus != 0).collect();
        prop_assert_eq!(left, expected);
    }

    #[test]
    fn test_overlapping_code_evicts_only_overlaps(
        regions in prop::collection::vec((0u64..64, 1u64..4), 1..20),
        start in 0u64..64,
        size in 1u64..8,
    ) {
        // Lay out non-overlapping regions on a 0x100 grid
        let mut map = CodeMap::new();
        let mut placed = Vec::new();
        let mut cursor = 0u64;
        for (gap, len) in regions {
            let region_start = 0x1000 + (cursor + gap) * 0x100;
            let region_size = len * 0x100;
            map.add_code(region_start, CodeEntry::dynamic(region_size, format!("r{region_start:#x}"), "JS"));
            placed.push((region_start, region_size));
            cursor += gap + len;
        }

        let new_start = 0x1000 + start * 0x100 + 0x10;
        let new_size = size * 0x80;
        let new_id = map.add_code(new_start, CodeEntry::dynamic(new_size, "new", "JS"));

        for addr in [new_start, new_start + new_size - 1] {
            prop_assert_eq!(map.find_entry(addr), Some(new_id));
        }
        for (region_start, region_size) in placed {
            let overlaps = region_start < new_start + new_size && new_start < region_start + region_size;
            let survived = map.find_dynamic_entry_by_start_address(region_start).is_some();
            prop_assert_eq!(survived, !overlaps, "region {:#x}", region_start);
        }
    }
}

#[test]
fn test_move_missing_code_fails_without_change() {
    let mut map = CodeMap::new();
    let id = map.add_code(0x1000, CodeEntry::dynamic(0x20, "foo", "JS"));
    assert!(map.move_code(0x3000, 0x4000).is_err());
    assert_eq!(map.find_entry(0x1010), Some(id));
    assert_eq!(map.find_entry(0x4010), None);

    map.move_code(0x1000, 0x4000).unwrap();
    assert_eq!(map.find_entry(0x1010), None);
    assert_eq!(map.find_entry(0x4010), Some(id));
}

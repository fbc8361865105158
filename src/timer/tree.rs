//! 到期树数据结构实现
//! Expiry Tree Data Structure Implementation
//!
//! 该模块实现了一个有序的到期时间结构，将绝对到期时间映射到注册句柄。
//! 与最小堆不同，它支持在到期前按句柄 O(log n) 删除。
//!
//! This module implements an ordered expiry structure mapping absolute expiry
//! timestamps to registration handles. Unlike a min-heap it supports O(log n)
//! removal by handle before expiry.

mod core;
mod entry;
mod stats;

pub use self::core::ExpiryTree;
pub use entry::{EntryHandle, ExpiryEntry};
pub use stats::ExpiryTreeStats;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::error::TimerError;
    use std::collections::HashSet;

    #[test]
    fn test_tree_creation() {
        let tree = ExpiryTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert!(tree.first().is_none());
    }

    #[test]
    fn test_add_and_first() {
        let mut tree = ExpiryTree::new();
        let a = tree.add(100);
        assert_eq!(tree.first(), Some((a, 100)));

        let b = tree.add(50);
        assert_eq!(tree.first(), Some((b, 50)));

        tree.add(150);
        assert_eq!(tree.first(), Some((b, 50)));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_remove_updates_first() {
        let mut tree = ExpiryTree::new();
        let a = tree.add(100);
        let b = tree.add(50);
        let c = tree.add(150);

        assert_eq!(tree.remove(b), Ok(50));
        assert_eq!(tree.first(), Some((a, 100)));
        assert_eq!(tree.remove(a), Ok(100));
        assert_eq!(tree.first(), Some((c, 150)));
        assert_eq!(tree.remove(c), Ok(150));
        assert!(tree.first().is_none());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_unknown_handle_reports_error() {
        let mut tree = ExpiryTree::new();
        let a = tree.add(10);
        let b = tree.add(20);
        assert_eq!(tree.remove(a), Ok(10));

        // 二次删除
        // Double removal
        assert_eq!(tree.remove(a), Err(TimerError::UnknownEntry(a)));
        // 树保持完整
        // Tree is left intact
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.first(), Some((b, 20)));
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut tree = ExpiryTree::new();
        let old = tree.add(10);
        tree.remove(old).unwrap();

        let new = tree.add(30);
        assert_eq!(old.index(), new.index(), "slot should be reused");
        assert_ne!(old, new);

        assert!(!tree.contains(old));
        assert!(tree.remove(old).is_err());
        assert_eq!(tree.expiry_of(new), Some(30));
    }

    #[test]
    fn test_ties_are_broken_by_insertion_order() {
        let mut tree = ExpiryTree::new();
        let first = tree.add(100);
        let second = tree.add(100);
        let third = tree.add(100);

        assert_eq!(tree.first(), Some((first, 100)));
        let order: Vec<_> = tree.expired(100).into_iter().map(|(h, _)| h).collect();
        assert_eq!(order, vec![first, second, third]);

        tree.remove(first).unwrap();
        assert_eq!(tree.first(), Some((second, 100)));
    }

    #[test]
    fn test_expired_snapshot_is_inclusive_and_ordered() {
        let mut tree = ExpiryTree::new();
        let a = tree.add(100);
        let b = tree.add(50);
        let _c = tree.add(150);
        let d = tree.add(120);

        let expired = tree.expired(120);
        assert_eq!(expired, vec![(b, 50), (a, 100), (d, 120)]);

        assert!(tree.expired(49).is_empty());
        assert_eq!(tree.expired(u64::MAX).len(), 4);
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let mut tree = ExpiryTree::new();
        let a = tree.add(10);
        let b = tree.add(20);

        let snapshot = tree.expired(20);
        for (handle, _) in &snapshot {
            tree.remove(*handle).unwrap();
            // 在"投递"期间重新插入不会影响快照
            // Re-inserting during "delivery" does not affect the snapshot
            tree.add(5);
        }
        assert_eq!(snapshot, vec![(a, 10), (b, 20)]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut tree = ExpiryTree::with_capacity(8);
        let handles: Vec<_> = (1..=5).map(|i| tree.add(i * 10)).collect();
        assert_eq!(tree.len(), 5);

        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.first().is_none());
        for handle in handles {
            assert!(!tree.contains(handle));
        }

        let stats = tree.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.arena_slots, 5);
        assert_eq!(stats.free_slots, 5);
    }

    #[test]
    fn test_tree_stats() {
        let mut tree = ExpiryTree::new();
        assert_eq!(tree.stats(), ExpiryTreeStats::default());

        tree.add(300);
        let h = tree.add(100);
        tree.add(200);
        tree.remove(h).unwrap();

        let stats = tree.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.arena_slots, 3);
        assert_eq!(stats.free_slots, 1);
        assert_eq!(stats.earliest_us, Some(200));
        assert_eq!(stats.latest_us, Some(300));
        assert!(stats.to_string().contains("entries: 2"));
    }

    #[test]
    fn test_handle_uniqueness_under_churn() {
        let mut tree = ExpiryTree::new();
        let mut seen = HashSet::new();
        let mut live = Vec::new();

        for i in 0..1000u64 {
            let handle = tree.add(i % 37);
            assert!(seen.insert(handle), "handle {} reused while distinct", handle);
            live.push(handle);
            if i % 3 == 0 {
                let victim = live.remove(0);
                tree.remove(victim).unwrap();
            }
        }

        assert_eq!(tree.len(), live.len());
        let min = live.iter().filter_map(|h| tree.expiry_of(*h)).min();
        assert_eq!(tree.first().map(|(_, e)| e), min);
    }
}

//! 到期树核心实现
//! Expiry tree core implementation

use super::entry::{EntryHandle, ExpiryEntry, Slot};
use super::stats::ExpiryTreeStats;
use crate::timer::error::TimerError;
use std::collections::BTreeMap;
use tracing::trace;

/// 有序到期树
/// Ordered expiry tree
///
/// 条目按 `(expiry_us, seq)` 排序保存在平衡B树中，条目本身存放在带代数检查的
/// 竞技场里。插入、按句柄删除都是 O(log n)，最小值被缓存。
///
/// Entries are ordered by `(expiry_us, seq)` in a balanced B-tree while the
/// entries themselves live in a generation-checked arena. Insertion and removal
/// by handle are O(log n); the minimum is cached.
#[derive(Debug, Default)]
pub struct ExpiryTree {
    /// 竞技场槽位
    /// Arena slots
    pub(super) slots: Vec<Slot>,
    /// 可复用的空闲槽位索引
    /// Free slot indices available for reuse
    pub(super) free: Vec<u32>,
    /// 排序索引
    /// Ordering index
    pub(super) order: BTreeMap<(u64, u64), EntryHandle>,
    /// 下一个插入序号
    /// Next insertion sequence
    pub(super) next_seq: u64,
    /// 缓存的最小条目
    /// Cached minimum entry
    pub(super) cached_first: Option<(EntryHandle, u64)>,
}

impl ExpiryTree {
    /// 创建空的到期树
    /// Create empty expiry tree
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建预分配槽位的到期树
    /// Create expiry tree with pre-allocated slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// 插入一个新条目
    /// Insert a new entry
    pub fn add(&mut self, expiry_us: u64) -> EntryHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = ExpiryEntry { expiry_us, seq };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                EntryHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryHandle {
                    index,
                    generation: 0,
                }
            }
        };

        self.order.insert((expiry_us, seq), handle);

        // 相同到期时间时保留先插入的条目
        // Keep the earlier entry on equal expiry
        match self.cached_first {
            Some((_, first)) if first <= expiry_us => {}
            _ => self.cached_first = Some((handle, expiry_us)),
        }

        trace!(%handle, expiry_us, entries = self.order.len(), "Added expiry entry");
        handle
    }

    /// 按句柄删除条目，返回其到期时间
    /// Remove an entry by handle, returning its expiry time
    ///
    /// 未知或过期的句柄返回 [`TimerError::UnknownEntry`]，树保持不变。
    ///
    /// An unknown or stale handle yields [`TimerError::UnknownEntry`] and leaves
    /// the tree untouched.
    pub fn remove(&mut self, handle: EntryHandle) -> Result<u64, TimerError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(TimerError::UnknownEntry(handle))?;
        let entry = slot.entry.take().ok_or(TimerError::UnknownEntry(handle))?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.order.remove(&(entry.expiry_us, entry.seq));

        if matches!(self.cached_first, Some((first, _)) if first == handle) {
            self.cached_first = self
                .order
                .first_key_value()
                .map(|(&(expiry_us, _), &h)| (h, expiry_us));
        }

        trace!(%handle, expiry_us = entry.expiry_us, entries = self.order.len(), "Removed expiry entry");
        Ok(entry.expiry_us)
    }

    /// 最小到期条目
    /// Entry with the minimum expiry
    pub fn first(&self) -> Option<(EntryHandle, u64)> {
        self.cached_first
    }

    /// 快照所有 `expiry_us <= now_us` 的条目，按到期时间升序、插入顺序排列
    /// Snapshot every entry with `expiry_us <= now_us`, ascending by expiry then insertion
    ///
    /// 返回的是物化的列表，调用方可以在投递回调期间自由修改树。
    /// The result is materialized, so callers may mutate the tree while delivering.
    pub fn expired(&self, now_us: u64) -> Vec<(EntryHandle, u64)> {
        self.order
            .range(..=(now_us, u64::MAX))
            .map(|(&(expiry_us, _), &handle)| (handle, expiry_us))
            .collect()
    }

    /// 查询句柄的到期时间
    /// Look up the expiry of a handle
    pub fn expiry_of(&self, handle: EntryHandle) -> Option<u64> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry)
            .map(|entry| entry.expiry_us)
    }

    pub fn contains(&self, handle: EntryHandle) -> bool {
        self.expiry_of(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 清空所有条目，已发出的句柄全部失效
    /// Remove all entries; every outstanding handle becomes stale
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.order.clear();
        self.cached_first = None;
    }

    /// 获取统计信息
    /// Get statistics
    pub fn stats(&self) -> ExpiryTreeStats {
        ExpiryTreeStats {
            entries: self.order.len(),
            arena_slots: self.slots.len(),
            free_slots: self.free.len(),
            earliest_us: self.cached_first.map(|(_, expiry_us)| expiry_us),
            latest_us: self.order.last_key_value().map(|(&(expiry_us, _), _)| expiry_us),
        }
    }
}

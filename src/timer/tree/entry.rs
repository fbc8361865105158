//! 到期树条目与句柄
//! Expiry tree entries and handles

use std::fmt;

/// 到期条目句柄：竞技场槽位索引加代数计数
/// Expiry entry handle: arena slot index plus a generation counter
///
/// 槽位每次被释放时代数都会递增，因此过期的句柄会被检测出来，
/// 而不会误指向复用同一槽位的新条目。
///
/// The generation is bumped whenever the slot is freed, so a stale handle is
/// detected instead of aliasing a newer entry that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle {
    pub(super) index: u32,
    pub(super) generation: u32,
}

impl EntryHandle {
    /// 槽位索引
    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// 槽位代数
    /// Slot generation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}v{}", self.index, self.generation)
    }
}

/// 到期树中的条目
/// Entry stored in the expiry tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryEntry {
    /// 绝对到期时间（微秒）
    /// Absolute expiry time (microseconds)
    pub expiry_us: u64,
    /// 插入序号，用于稳定地打破相同到期时间的平局
    /// Insertion sequence, breaks ties between equal expiry times stably
    pub seq: u64,
}

/// 竞技场槽位
/// Arena slot
#[derive(Debug, Default)]
pub(super) struct Slot {
    pub(super) generation: u32,
    pub(super) entry: Option<ExpiryEntry>,
}

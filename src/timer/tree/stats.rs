//! 到期树统计信息
//! Expiry tree statistics

/// 到期树统计信息
/// Expiry tree statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryTreeStats {
    /// 当前条目数
    /// Number of live entries
    pub entries: usize,
    /// 竞技场槽位总数
    /// Total arena slots
    pub arena_slots: usize,
    /// 空闲槽位数
    /// Free arena slots
    pub free_slots: usize,
    /// 最早到期时间
    /// Earliest expiry
    pub earliest_us: Option<u64>,
    /// 最晚到期时间
    /// Latest expiry
    pub latest_us: Option<u64>,
}

impl std::fmt::Display for ExpiryTreeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExpiryTreeStats {{ entries: {}, slots: {}/{} free, earliest: {:?}, latest: {:?} }}",
            self.entries, self.free_slots, self.arena_slots, self.earliest_us, self.latest_us
        )
    }
}

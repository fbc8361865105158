//! 定时器层错误类型
//! Timer layer error types

use super::tree::EntryHandle;

/// 定时器错误类型
/// Timer error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// 句柄不在到期树中（已移除、已触发或从未存在）
    /// The handle is not present in the expiry tree (removed, fired, or never existed)
    #[error("expiry entry {0} is not registered")]
    UnknownEntry(EntryHandle),
    /// 周期定时器的间隔不能为零
    /// A periodic timer interval cannot be zero
    #[error("periodic interval must be non-zero")]
    ZeroInterval,
}

//! 处理器状态与转换验证
//! Handler state and transition validation
//!
//! 处理器的生命周期为 `Idle → Connected → Handling → Finalizing → Idle`。
//! 接受失败的处理器直接从 `Idle` 进入 `Finalizing`；连接后但尚未开始处理的
//! 处理器（例如被终止）可以从 `Connected` 进入 `Finalizing`。
//!
//! A handler's lifecycle is `Idle → Connected → Handling → Finalizing → Idle`.
//! A handler whose accept failed moves straight from `Idle` to `Finalizing`;
//! one that connected but never started handling may go from `Connected` to
//! `Finalizing`.

use std::fmt;

/// 连接处理器状态
/// Connection handler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandlerState {
    /// 没有连接，可以被分配
    /// No connection, ready to be assigned
    #[default]
    Idle,
    /// 已接受连接，尚未开始处理
    /// Connection accepted, not yet handling
    Connected,
    /// 正在运行服务逻辑
    /// Running the service body
    Handling,
    /// 正在关闭套接字并交还处理器
    /// Closing the socket and handing the handler back
    Finalizing,
}

impl HandlerState {
    /// 验证状态转换是否合法
    /// Validate if state transition is legal
    pub fn can_transition_to(self, next: HandlerState) -> bool {
        use HandlerState::*;

        matches!(
            (self, next),
            (Idle, Connected)
                | (Idle, Finalizing)
                | (Connected, Handling)
                | (Connected, Finalizing)
                | (Handling, Finalizing)
                | (Finalizing, Idle)
        )
    }

    /// 处理器是否持有已接受的连接
    /// Whether the handler holds an accepted connection
    pub fn is_connected(self) -> bool {
        matches!(self, HandlerState::Connected | HandlerState::Handling)
    }

    pub fn is_idle(self) -> bool {
        self == HandlerState::Idle
    }

    /// 执行一次已验证的转换
    /// Perform a validated transition
    ///
    /// # Panics
    ///
    /// 非法转换是编程错误。
    /// An invalid transition is a programming error.
    #[track_caller]
    pub(crate) fn advance(&mut self, next: HandlerState) {
        assert!(
            self.can_transition_to(next),
            "invalid handler state transition: {self} -> {next}"
        );
        *self = next;
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerState::Idle => "Idle",
            HandlerState::Connected => "Connected",
            HandlerState::Handling => "Handling",
            HandlerState::Finalizing => "Finalizing",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HandlerState::*;

    const ALL: [HandlerState; 4] = [Idle, Connected, Handling, Finalizing];

    #[test]
    fn test_valid_transitions() {
        assert!(Idle.can_transition_to(Connected));
        assert!(Idle.can_transition_to(Finalizing));
        assert!(Connected.can_transition_to(Handling));
        assert!(Connected.can_transition_to(Finalizing));
        assert!(Handling.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Idle));
    }

    #[test]
    fn test_invalid_transitions() {
        let valid = 6;
        let allowed = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| from.can_transition_to(*to)))
            .filter(|ok| *ok)
            .count();
        assert_eq!(allowed, valid);

        assert!(!Idle.can_transition_to(Handling));
        assert!(!Handling.can_transition_to(Idle));
        assert!(!Finalizing.can_transition_to(Connected));
        for state in ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_advance() {
        let mut state = Idle;
        state.advance(Connected);
        state.advance(Handling);
        state.advance(Finalizing);
        state.advance(Idle);
        assert!(state.is_idle());
    }

    #[test]
    #[should_panic(expected = "invalid handler state transition: Idle -> Handling")]
    fn test_advance_rejects_invalid_transition() {
        let mut state = Idle;
        state.advance(Handling);
    }
}

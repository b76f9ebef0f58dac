//! 会话状态管理
//!
//! 提供会话状态转换逻辑。
//!
//! ## 状态转换规则
//! - Starting -> Running, Closing, Closed
//! - Running -> Closing
//! - Closing -> Closed
//! - Closed -> (终态)
//!
//! 状态只会前进，重复请求同一状态视为成功，
//! 因此"显式关闭"与"进程自然退出"之间的竞争不会产生错误。

use crate::pty::types::SessionState;

/// 状态转换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionResult {
    /// 转换成功
    Success,
    /// 已经处于目标状态
    Unchanged,
    /// 转换无效（当前状态不允许转换到目标状态）
    Invalid {
        from: SessionState,
        to: SessionState,
        reason: String,
    },
}

impl StateTransitionResult {
    /// 检查转换是否成功（状态确实发生了变化）
    pub fn is_success(&self) -> bool {
        matches!(self, StateTransitionResult::Success)
    }

    /// 检查转换是否失败
    pub fn is_invalid(&self) -> bool {
        matches!(self, StateTransitionResult::Invalid { .. })
    }
}

/// 会话状态管理器
///
/// 管理单个会话的状态转换，确保状态只向前推进。
#[derive(Debug, Clone)]
pub struct SessionStateManager {
    /// 当前状态
    current: SessionState,
    /// 会话 ID（用于日志）
    session_id: String,
    /// 关闭原因
    close_reason: Option<String>,
}

impl SessionStateManager {
    /// 创建新的状态管理器
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_state(session_id, SessionState::Starting)
    }

    /// 创建带初始状态的状态管理器
    pub fn with_state(session_id: impl Into<String>, state: SessionState) -> Self {
        Self {
            current: state,
            session_id: session_id.into(),
            close_reason: None,
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> SessionState {
        self.current
    }

    /// 获取关闭原因
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// 尝试转换到目标状态
    ///
    /// 如果转换有效，更新状态并返回 Success。
    /// 如果已处于目标状态，返回 Unchanged。
    /// 如果转换无效，保持当前状态并返回 Invalid。
    pub fn transition_to(&mut self, target: SessionState) -> StateTransitionResult {
        if self.current == target {
            return StateTransitionResult::Unchanged;
        }

        if Self::is_valid_transition(self.current, target) {
            let from = self.current;
            self.current = target;

            tracing::debug!(
                "会话 {} 状态转换: {:?} -> {:?}",
                self.session_id,
                from,
                target
            );

            StateTransitionResult::Success
        } else {
            let reason = Self::get_invalid_transition_reason(self.current, target);
            tracing::debug!(
                "会话 {} 忽略状态转换: {:?} -> {:?}, 原因: {}",
                self.session_id,
                self.current,
                target,
                reason
            );

            StateTransitionResult::Invalid {
                from: self.current,
                to: target,
                reason,
            }
        }
    }

    /// 开始关闭，并记录原因
    ///
    /// 只有第一次调用会记录原因并返回 Success。
    pub fn begin_closing(&mut self, reason: impl Into<String>) -> StateTransitionResult {
        let result = self.transition_to(SessionState::Closing);
        if result.is_success() {
            self.close_reason = Some(reason.into());
        }
        result
    }

    /// 检查状态转换是否有效
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        if from == to {
            return true;
        }

        match from {
            SessionState::Starting => matches!(
                to,
                SessionState::Running | SessionState::Closing | SessionState::Closed
            ),
            SessionState::Running => matches!(to, SessionState::Closing),
            SessionState::Closing => matches!(to, SessionState::Closed),
            SessionState::Closed => false, // 终态
        }
    }

    /// 获取无效转换的原因
    fn get_invalid_transition_reason(from: SessionState, to: SessionState) -> String {
        match from {
            SessionState::Closed => "会话已关闭，不能再转换状态".to_string(),
            SessionState::Closing => "会话正在关闭".to_string(),
            _ => format!("不允许从 {:?} 转换到 {:?}", from, to),
        }
    }

    /// 会话是否接受输入
    pub fn accepts_input(&self) -> bool {
        matches!(self.current, SessionState::Starting | SessionState::Running)
    }

    /// 检查会话是否处于终态
    pub fn is_closed(&self) -> bool {
        self.current == SessionState::Closed
    }

    /// 检查会话是否已开始关闭（Closing 或 Closed）
    pub fn is_closing(&self) -> bool {
        matches!(self.current, SessionState::Closing | SessionState::Closed)
    }
}

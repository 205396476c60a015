//! 通用枚举模块。
//!
//! 定义服务会话在服务端的生命周期状态。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 服务端单个会话的生命周期状态。
///
/// 状态迁移：`Created -> Running -> {Closed, Failed, TimedOut}`。
/// 所有终止状态最终都会导致会话从分发器的会话表中移除。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    /// 会话已登记，服务任务尚未开始运行。
    Created,
    /// 服务任务正在运行。
    Running,
    /// 收到终止哨兵，或服务正常返回。
    Closed,
    /// 服务执行出错（或发送失败），错误已作为异常消息交给客户端。
    Failed,
    /// 回收器检测到客户端超时。
    TimedOut,
}

impl ConversationState {
    /// 是否为终止状态。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationState::Closed | ConversationState::Failed | ConversationState::TimedOut
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

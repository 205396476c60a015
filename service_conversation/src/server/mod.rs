// service_conversation/src/server/mod.rs

//! 会话服务端模块。
//!
//! - `service`: 服务类型注册（`ServiceFactory`）与服务实现接口（`ConversationService`）；
//! - `conversation`: 单个会话在服务端的状态；
//! - `dispatcher`: `ConversationServer`，负责入站消息路由、会话创建和客户端传输登记；
//! - `messenger`: 服务任务内部使用的 `ServiceMessenger`；
//! - `reaper`: 周期性回收空闲超时会话的后台任务；
//! - `ws_gateway`: WebSocket 网关，把远端客户端接入 `ConversationServer`。

pub mod conversation;
pub mod dispatcher;
pub mod messenger;
pub mod reaper;
pub mod service;
pub mod ws_gateway;

use std::time::Duration;

use crate::sequencer::DEFAULT_MAX_BUFFERED;

pub use dispatcher::ConversationServer;
pub use messenger::ServiceMessenger;
pub use service::{ConversationService, ServiceDefinition, ServiceFactory};

/// 回收器的默认最大检查周期。实际周期取此值与最小客户端超时中的较小者。
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// `ConversationServer` 的配置。
#[derive(Debug, Clone)]
pub struct ConversationServerConfig {
    /// 回收器检查周期的上限。
    pub reaper_interval: Duration,
    /// 每个会话入站方向最多缓冲的超前消息数。
    pub max_buffered_messages: usize,
}

impl Default for ConversationServerConfig {
    fn default() -> Self {
        Self {
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            max_buffered_messages: DEFAULT_MAX_BUFFERED,
        }
    }
}

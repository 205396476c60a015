// service_conversation/src/client/mod.rs

//! 会话客户端模块。
//!
//! - `conversation_client`: `ConversationClient`，启动会话并把服务端回送的消息路由到对应句柄；
//! - `conversation`: `ClientConversation` 句柄，在单个会话内收发消息；
//! - `ws_connector`: 通过 WebSocket 连接远端 `ConversationServer`。

pub mod conversation;
pub mod conversation_client;
pub mod ws_connector;

use std::time::Duration;

use crate::sequencer::DEFAULT_MAX_BUFFERED;

pub use conversation::ClientConversation;
pub use conversation_client::ConversationClient;

/// 客户端配置。
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `receive` 等待服务端回复的默认时长，超时返回 `ConversationError::Timeout`。
    pub receive_timeout: Duration,
    /// 远程启动会话请求的等待时长。
    pub start_timeout: Duration,
    /// 每个会话入站方向最多缓冲的超前消息数。
    pub max_buffered_messages: usize,
    /// 尚无句柄的会话 ID 的暂存消息保留多久。超时未被领取即丢弃。
    pub pending_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(10),
            max_buffered_messages: DEFAULT_MAX_BUFFERED,
            pending_ttl: Duration::from_secs(30),
        }
    }
}

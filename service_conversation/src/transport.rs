// service_conversation/src/transport.rs

//! 传输层抽象。
//!
//! 会话核心只依赖两个能力：
//! - `MessageTransport`: 单方向投递一条 `ConversationMessage`（至少一次、不重排）；
//! - `RemoteConversationServer`: 一次性的同步请求/响应，用于启动会话。
//!
//! 任何能满足这两个契约的通道（进程内 mpsc、WebSocket、消息队列……）都可以替换，
//! 而不影响会话与排序逻辑。

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::ConversationError;
use crate::message::ConversationMessage;

/// 单方向投递会话消息的能力。
///
/// `send` 不应阻塞；需要异步写出的实现应自行排队（例如交给后台写任务）。
pub trait MessageTransport: Send + Sync {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError>;
}

/// 远端的“启动会话”调用。
pub trait RemoteConversationServer: Send + Sync {
    /// 请求服务端为 `client_id` 启动一个 `service_type_id` 类型的会话，返回会话 ID。
    fn start_conversation<'a>(
        &'a self,
        service_type_id: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<String, ConversationError>>;
}

/// 基于 tokio 无界 mpsc 通道的传输实现。
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<ConversationMessage>,
}

impl ChannelTransport {
    /// 创建传输及其接收端。
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversationMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: mpsc::UnboundedSender<ConversationMessage>) -> Self {
        Self { sender }
    }
}

impl MessageTransport for ChannelTransport {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        self.sender
            .send(message)
            .map_err(|_| ConversationError::SendErrorClosed)
    }
}

/// 以闭包实现的传输，便于把消息直接交给另一个组件。
pub struct FnTransport<F>(pub F);

impl<F> MessageTransport for FnTransport<F>
where
    F: Fn(ConversationMessage) -> Result<(), ConversationError> + Send + Sync,
{
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        (self.0)(message)
    }
}

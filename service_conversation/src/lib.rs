// service_conversation/src/lib.rs

//! 多路复用、有状态的服务会话协议。
//!
//! 客户端请求某个服务类型后，服务端为其创建一个会话并在专属任务上运行一个服务实例；
//! 双方此后通过同一个会话 ID 双向交换带序号的消息。每个方向：
//! - 序号从 0 开始连续递增，接收方丢弃重复、缓冲超前的消息，保证按序且仅交付一次；
//! - 异常消息占用一个序号，在对端下一次接收时以错误形式抛出；
//! - 终止哨兵不占序号，收到即结束会话。
//!
//! 服务端的回收器会结束客户端长时间无消息的会话，并通知双方。
//!
//! 主要入口：
//! - 服务端：[`server::ConversationServer`]、[`server::ServiceDefinition`]、[`server::ServiceMessenger`]；
//! - 客户端：[`client::ConversationClient`]、[`client::ClientConversation`]；
//! - 传输：[`transport::MessageTransport`]，以及 WebSocket 绑定
//!   [`server::ws_gateway::WsGateway`] / [`client::ws_connector::connect_client`]。

pub mod client;
pub mod error;
pub mod message;
pub mod sequencer;
pub mod server;
pub mod transport;
pub mod wire;

pub use client::{ClientConfig, ClientConversation, ConversationClient};
pub use error::{
    CLIENT_TIMEOUT_ERROR_NAME, CONVERSATION_ERROR_TYPE_NAME, ConversationError, OPAQUE_ERROR_TYPE_NAME,
    PANIC_ERROR_NAME,
};
pub use message::{ConversationMessage, MessageBody};
pub use server::{ConversationServer, ConversationServerConfig, ServiceDefinition, ServiceMessenger};
pub use transport::{ChannelTransport, MessageTransport, RemoteConversationServer};

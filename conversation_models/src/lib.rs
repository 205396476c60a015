//! `conversation_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了服务会话协议各组件（`service_conversation` 核心库、
//! `conversation_server` 独立服务端以及任何客户端实现）之间共享的可序列化数据结构。
//!
//! 主要包含：
//! - **会话负载 (`payloads`)**: 客户端注册、启动会话请求/响应、回显测试负载等，
//!   以及 WebSocket 线路层使用的消息类型常量。
//! - **通用枚举 (`enums`)**: 会话生命周期状态 `ConversationState`。
//!
//! 所有模型均派生 `Serialize`/`Deserialize`/`Debug`/`Clone`，保证跨进程边界时结构一致。

pub mod enums;
pub mod payloads;

pub use enums::ConversationState;

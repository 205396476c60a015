// conversation_models/src/payloads.rs

//! 服务会话协议中使用的各种负载结构体定义。
//!
//! 其中 `RegisterClientPayload`、`StartConversationRequest`、`StartConversationResponse`
//! 由 WebSocket 线路层承载；`EchoPayload` 供回显服务和测试使用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 线路消息类型：客户端注册（连接建立后的第一条消息）。
pub const REGISTER_CLIENT_MESSAGE_TYPE: &str = "register_client";
/// 线路消息类型：启动会话请求。
pub const START_CONVERSATION_MESSAGE_TYPE: &str = "start_conversation";
/// 线路消息类型：启动会话结果。
pub const START_CONVERSATION_RESULT_MESSAGE_TYPE: &str = "start_conversation_result";
/// 线路消息类型：会话内消息。
pub const CONVERSATION_MESSAGE_TYPE: &str = "conversation_message";

/// 回显服务的负载。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EchoPayload {
    /// 需要回显的内容。
    pub content: String,
}

/// 客户端注册负载，告诉服务端此连接对应哪个 `client_id`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegisterClientPayload {
    pub client_id: String,
    /// 客户端发起注册的时间 (UTC)。
    pub connected_at: DateTime<Utc>,
}

impl RegisterClientPayload {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connected_at: Utc::now(),
        }
    }
}

/// 启动会话请求。`request_id` 用于把异步返回的结果与请求配对。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartConversationRequest {
    pub request_id: String,
    pub service_type_id: String,
}

impl StartConversationRequest {
    /// 创建请求，自动生成 UUID v4 作为 `request_id`。
    pub fn new(service_type_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            service_type_id: service_type_id.into(),
        }
    }
}

/// 启动会话的结果：成功时带 `conversation_id`，失败时带错误类别和描述。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartConversationResponse {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub error: Option<StartConversationFailure>,
}

/// 启动会话失败的原因。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StartConversationFailure {
    UnknownServiceType(String),
    UnknownClient(String),
    Other(String),
}

impl StartConversationResponse {
    pub fn success(request_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_id: Some(conversation_id.into()),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: StartConversationFailure) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_id: None,
            error: Some(error),
        }
    }
}

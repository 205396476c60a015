// service_conversation/src/message.rs

//! 定义会话内传递的核心消息结构。
//!
//! `ConversationMessage` 是客户端与服务端之间在某个会话内交换的唯一消息格式。
//! 每个方向各自维护从 0 开始严格递增的 `message_index`，接收方据此去重和排序。
//! 终止哨兵使用保留序号 `TERMINATE_INDEX`，接收方会绕过排序立即处理。

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ConversationError;

/// 终止哨兵使用的保留序号。
pub const TERMINATE_INDEX: u64 = u64::MAX;

/// 消息体：普通负载、异常、终止三者必居其一。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessageBody {
    /// JSON 格式的业务负载字符串。
    Payload(String),
    /// 对端的执行失败描述。
    Exception(String),
    /// 终止哨兵。
    Terminate,
}

/// 会话消息。
///
/// # 字段
/// - `conversation_id`: 所属会话的全局唯一标识。
/// - `message_index`: 本方向上的序号，从 0 开始严格递增；终止哨兵为 `TERMINATE_INDEX`。
/// - `body`: 消息体。
/// - `timestamp`: 消息创建时的 UTC 毫秒时间戳，仅用于诊断，不参与排序。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub conversation_id: String,
    pub message_index: u64,
    pub body: MessageBody,
    pub timestamp: i64,
}

impl ConversationMessage {
    fn with_body(conversation_id: impl Into<String>, message_index: u64, body: MessageBody) -> Self {
        ConversationMessage {
            conversation_id: conversation_id.into(),
            message_index,
            body,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// 创建一条普通负载消息，`payload_data` 会被序列化为 JSON 字符串。
    ///
    /// # Returns
    /// 序列化失败时返回 `ConversationError::SerializationError`。
    pub fn payload<T: Serialize + ?Sized>(
        conversation_id: impl Into<String>,
        message_index: u64,
        payload_data: &T,
    ) -> Result<Self, ConversationError> {
        let payload_str = serde_json::to_string(payload_data).map_err(|e| {
            ConversationError::SerializationError(format!("创建会话消息时序列化载荷失败: {}", e))
        })?;
        Ok(Self::with_body(conversation_id, message_index, MessageBody::Payload(payload_str)))
    }

    /// 创建一条异常消息，占用本方向的一个序号。
    pub fn exception(
        conversation_id: impl Into<String>,
        message_index: u64,
        description: impl Into<String>,
    ) -> Self {
        Self::with_body(conversation_id, message_index, MessageBody::Exception(description.into()))
    }

    /// 创建终止哨兵。
    pub fn terminate(conversation_id: impl Into<String>) -> Self {
        Self::with_body(conversation_id, TERMINATE_INDEX, MessageBody::Terminate)
    }

    pub fn is_terminate(&self) -> bool {
        matches!(self.body, MessageBody::Terminate)
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.body, MessageBody::Exception(_))
    }

    /// 异常描述；非异常消息返回 `None`。
    pub fn exception_description(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Exception(description) => Some(description),
            _ => None,
        }
    }

    /// 将负载反序列化为目标类型 `T`。
    ///
    /// 对异常消息或终止哨兵调用会返回 `DeserializationError`，调用方应先检查消息体。
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ConversationError> {
        match &self.body {
            MessageBody::Payload(payload) => serde_json::from_str(payload).map_err(|e| {
                ConversationError::DeserializationError(format!(
                    "会话消息载荷反序列化为目标类型失败: {}, 原始载荷: '{}'",
                    e, payload
                ))
            }),
            other => Err(ConversationError::DeserializationError(format!(
                "会话 {} 的消息 #{} 不含负载: {:?}",
                self.conversation_id, self.message_index, other
            ))),
        }
    }
}

// service_conversation/src/wire.rs

//! WebSocket 线路层的消息信封。
//!
//! 每个 WebSocket 文本帧承载一个 `WireEnvelope`：`message_type` 指明负载的种类
//! （见 `conversation_models::payloads` 中的常量），`payload` 是对应结构体的 JSON 字符串。

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use crate::error::ConversationError;

/// 线路信封。
///
/// # 字段
/// - `message_id`: UUID v4，便于在日志中追踪单条帧；
/// - `message_type`: 负载种类；
/// - `payload`: JSON 格式的负载；
/// - `timestamp`: 创建时的 UTC 毫秒时间戳。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireEnvelope {
    pub message_id: String,
    pub message_type: String,
    pub payload: String,
    pub timestamp: i64,
}

impl WireEnvelope {
    /// 创建信封，`payload_data` 会被序列化为 JSON 字符串。
    pub fn new<T: Serialize + ?Sized>(
        message_type: &str,
        payload_data: &T,
    ) -> Result<WireEnvelope, ConversationError> {
        let payload = serde_json::to_string(payload_data).map_err(|e| {
            ConversationError::SerializationError(format!("创建线路信封时序列化载荷失败: {}", e))
        })?;
        Ok(WireEnvelope {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ConversationError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            ConversationError::DeserializationError(format!(
                "线路信封 ({}) 载荷反序列化失败: {}, 原始载荷: '{}'",
                self.message_type, e, self.payload
            ))
        })
    }

    /// 编码为 WebSocket 文本帧。
    pub fn to_frame(&self) -> Result<Message, ConversationError> {
        let text = serde_json::to_string(self).map_err(|e| {
            ConversationError::SerializationError(format!("线路信封序列化为JSON失败: {}", e))
        })?;
        Ok(Message::Text(text))
    }
}

/// 从 WebSocket 接收流中读取下一个信封。
///
/// 跳过 Ping/Pong 等控制帧；二进制帧视为错误；连接关闭时返回 `None`。
pub async fn receive_envelope<S>(stream: &mut S) -> Option<Result<WireEnvelope, ConversationError>>
where
    S: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("[线路] 收到文本帧: '{}'", text);
                break Some(serde_json::from_str::<WireEnvelope>(&text).map_err(|e| {
                    ConversationError::DeserializationError(format!(
                        "文本帧反序列化为 WireEnvelope 失败: {}, 原始文本: '{}'",
                        e, text
                    ))
                }));
            }
            Some(Ok(Message::Binary(bin))) => {
                debug!("[线路] 收到二进制帧，长度: {} 字节", bin.len());
                break Some(Err(ConversationError::Transport(
                    "收到了非预期的 WebSocket 二进制帧".to_string(),
                )));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                // 控制帧由底层库处理
            }
            Some(Ok(Message::Close(close_frame))) => {
                debug!("[线路] 收到 Close 控制帧: {:?}", close_frame);
                break None;
            }
            Some(Err(TungsteniteError::ConnectionClosed)) | Some(Err(TungsteniteError::AlreadyClosed)) => {
                debug!("[线路] 连接已关闭。");
                break None;
            }
            Some(Err(e)) => {
                error!("[线路] 从 WebSocket 流接收消息时发生底层错误: {}", e);
                break Some(Err(ConversationError::WebSocketProtocolError(e)));
            }
            None => {
                debug!("[线路] 接收流已结束。");
                break None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conversation_models::payloads::{
        CONVERSATION_MESSAGE_TYPE, START_CONVERSATION_MESSAGE_TYPE, StartConversationRequest,
    };
    use futures_util::stream;

    use crate::message::ConversationMessage;

    #[test]
    fn test_envelope_carries_typed_payload() {
        let request = StartConversationRequest::new("echo");
        let envelope = WireEnvelope::new(START_CONVERSATION_MESSAGE_TYPE, &request).unwrap();
        assert_eq!(envelope.message_type, START_CONVERSATION_MESSAGE_TYPE);
        assert!(!envelope.message_id.is_empty());
        let decoded: StartConversationRequest = envelope.deserialize_payload().unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_receive_envelope_skips_control_frames() {
        let message = ConversationMessage::payload("c", 0, "One").unwrap();
        let envelope = WireEnvelope::new(CONVERSATION_MESSAGE_TYPE, &message).unwrap();
        let frames = vec![
            Ok(Message::Ping(vec![1])),
            Ok(envelope.to_frame().unwrap()),
            Ok(Message::Close(None)),
        ];
        let mut stream = stream::iter(frames);

        let received = receive_envelope(&mut stream).await.unwrap().unwrap();
        let inner: ConversationMessage = received.deserialize_payload().unwrap();
        assert_eq!(inner, message);
        assert!(receive_envelope(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_envelope_rejects_binary() {
        let mut stream = stream::iter(vec![Ok::<_, TungsteniteError>(Message::Binary(vec![0, 1]))]);
        let result = receive_envelope(&mut stream).await.unwrap();
        assert!(matches!(result, Err(ConversationError::Transport(_))));
    }
}

// service_conversation/src/error.rs

//! 定义服务会话协议相关的错误类型。

use thiserror::Error;

/// 客户端超时异常的限定名。回收器发给客户端的超时异常描述总以此开头。
pub const CLIENT_TIMEOUT_ERROR_NAME: &str = "service_conversation::ClientTimeout";

/// `ConversationError` 的限定类型名，服务失败描述以 `{类型名}::{变体名}: ` 开头。
pub const CONVERSATION_ERROR_TYPE_NAME: &str = "service_conversation::ConversationError";

/// 服务返回的非 `ConversationError` 错误，其失败描述以此开头。
pub const OPAQUE_ERROR_TYPE_NAME: &str = "anyhow::Error";

/// 服务 panic 时失败描述的前缀。
pub const PANIC_ERROR_NAME: &str = "panic";

/// 服务会话库的统一错误类型。
#[derive(Error, Debug)]
pub enum ConversationError {
    /// 启动会话时指定的服务类型未注册。
    #[error("未知的服务类型: {0}")]
    UnknownServiceType(String),

    /// 启动会话时该客户端没有登记响应传输通道。
    #[error("未知的客户端: {0}")]
    UnknownClient(String),

    /// 重复注册同一个服务类型（配置错误）。
    #[error("服务类型重复注册: {0}")]
    DuplicateServiceType(String),

    /// 服务端的服务执行失败，客户端据此抛出。
    #[error("会话 {conversation_id} 的服务执行失败: {description}")]
    ServiceExecution {
        conversation_id: String,
        description: String,
    },

    /// 客户端报告的错误，在服务任务内部的 `receive` 中抛出。
    #[error("会话 {conversation_id} 的客户端执行失败: {description}")]
    ClientExecution {
        conversation_id: String,
        description: String,
    },

    /// 服务端：客户端在 `timeout_ms` 内没有任何消息，会话被回收。
    #[error("{}: 会话 {} 的客户端超过 {} 毫秒无消息", CLIENT_TIMEOUT_ERROR_NAME, .conversation_id, .timeout_ms)]
    ClientTimeout {
        conversation_id: String,
        timeout_ms: u64,
    },

    /// 客户端：等待服务端回复超时。服务端状态不受影响。
    #[error("会话 {conversation_id} 等待回复超时 ({waited_ms} 毫秒)")]
    Timeout {
        conversation_id: String,
        waited_ms: u64,
    },

    /// 会话已被终止哨兵关闭，服务任务应将其视为正常退出。
    #[error("会话 {conversation_id} 已终止")]
    Terminated { conversation_id: String },

    /// 会话在本地已关闭（客户端句柄调用过 `close`，或服务端已移除会话）。
    #[error("会话已关闭: {0}")]
    ConversationClosed(String),

    #[error("序列化错误: {0}")]
    SerializationError(String),

    #[error("反序列化错误: {0}")]
    DeserializationError(String),

    /// 传输层投递失败。
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("WebSocket协议错误: {0}")]
    WebSocketProtocolError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    /// 当前线程不在 tokio 运行时内，无法派生会话任务。
    #[error("tokio 运行时不可用: {0}")]
    RuntimeUnavailable(String),

    /// 尚未建立连接或连接已断开。
    #[error("未连接")]
    NotConnected,

    #[error("发送错误: 通道已关闭")]
    SendErrorClosed,
}

impl ConversationError {
    /// 此错误是否表示会话被终止哨兵正常关闭。
    pub fn is_terminated(&self) -> bool {
        matches!(self, ConversationError::Terminated { .. })
    }

    /// 此错误是否由回收器的客户端超时引起。
    pub fn is_client_timeout(&self) -> bool {
        matches!(self, ConversationError::ClientTimeout { .. })
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ConversationError::UnknownServiceType(_) => "UnknownServiceType",
            ConversationError::UnknownClient(_) => "UnknownClient",
            ConversationError::DuplicateServiceType(_) => "DuplicateServiceType",
            ConversationError::ServiceExecution { .. } => "ServiceExecution",
            ConversationError::ClientExecution { .. } => "ClientExecution",
            ConversationError::ClientTimeout { .. } => "ClientTimeout",
            ConversationError::Timeout { .. } => "Timeout",
            ConversationError::Terminated { .. } => "Terminated",
            ConversationError::ConversationClosed(_) => "ConversationClosed",
            ConversationError::SerializationError(_) => "SerializationError",
            ConversationError::DeserializationError(_) => "DeserializationError",
            ConversationError::Transport(_) => "Transport",
            ConversationError::WebSocketProtocolError(_) => "WebSocketProtocolError",
            ConversationError::IoError(_) => "IoError",
            ConversationError::InvalidUrl(_) => "InvalidUrl",
            ConversationError::RuntimeUnavailable(_) => "RuntimeUnavailable",
            ConversationError::NotConnected => "NotConnected",
            ConversationError::SendErrorClosed => "SendErrorClosed",
        }
    }
}

/// 服务执行失败时发给客户端的描述：错误类型名 + 完整的错误链。
///
/// - `ConversationError`: `service_conversation::ConversationError::{变体}: {消息}`；
/// - 其他错误: `anyhow::Error: {消息}`。
pub fn service_failure_description(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ConversationError>() {
        Some(conversation_error) => format!(
            "{}::{}: {:#}",
            CONVERSATION_ERROR_TYPE_NAME,
            conversation_error.variant_name(),
            err
        ),
        None => format!("{}: {:#}", OPAQUE_ERROR_TYPE_NAME, err),
    }
}

/// 服务 panic 时发给客户端的描述。
pub fn panic_failure_description(message: &str) -> String {
    format!("{}: {}", PANIC_ERROR_NAME, message)
}

pub type Result<T, E = ConversationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_timeout_description_starts_with_qualified_name() {
        let err = ConversationError::ClientTimeout {
            conversation_id: "c--echo--1".to_string(),
            timeout_ms: 10,
        };
        assert!(err.to_string().starts_with(CLIENT_TIMEOUT_ERROR_NAME));
        assert!(err.is_client_timeout());
        assert!(!err.is_terminated());
    }

    #[test]
    fn test_failure_description_names_conversation_error_variant() {
        let err = anyhow::Error::new(ConversationError::DeserializationError("bad json".to_string()));
        let description = service_failure_description(&err);
        assert!(
            description.starts_with("service_conversation::ConversationError::DeserializationError: "),
            "{}",
            description
        );
        assert!(description.contains("bad json"));
    }

    #[test]
    fn test_failure_description_tags_opaque_errors_with_context() {
        let err = anyhow::anyhow!("磁盘已满").context("保存结果失败");
        let description = service_failure_description(&err);
        assert_eq!(description, "anyhow::Error: 保存结果失败: 磁盘已满");
    }

    #[test]
    fn test_panic_description_prefix() {
        assert_eq!(panic_failure_description("boom"), "panic: boom");
    }
}

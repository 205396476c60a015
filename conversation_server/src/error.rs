use service_conversation::ConversationError;
use thiserror::Error;

/// 服务端进程的错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("会话服务错误: {0}")]
    Conversation(#[from] ConversationError),

    #[error("WebSocket 网关错误: {0}")]
    Gateway(String),
}

//! 内置服务类型。

use std::sync::Arc;
use std::time::Duration;

use conversation_models::payloads::EchoPayload;
use log::{debug, info};
use service_conversation::{ConversationServer, ServiceDefinition, ServiceMessenger};

use crate::config::ServicesSettings;
use crate::error::AppError;

pub const ECHO_SERVICE_TYPE: &str = "echo";
pub const ACCUMULATOR_SERVICE_TYPE: &str = "accumulator";

/// 原样回送收到的 `EchoPayload`，直到会话结束。
pub async fn echo_service(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    loop {
        let payload: EchoPayload = messenger.receive().await?;
        debug!("[回显服务 {}] 收到: {}", messenger.conversation_id(), payload.content);
        messenger.send(&payload)?;
    }
}

/// 累加客户端发来的整数，每收到一个就回送当前总和。
pub async fn accumulator_service(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    let mut total: i64 = 0;
    loop {
        let value: i64 = messenger.receive().await?;
        total = total
            .checked_add(value)
            .ok_or_else(|| anyhow::anyhow!("累加溢出: {} + {}", total, value))?;
        messenger.send(&total)?;
    }
}

/// 按配置把内置服务类型注册到服务端。
pub fn register_builtin_services(
    server: &ConversationServer,
    settings: &ServicesSettings,
) -> Result<(), AppError> {
    server.add_service_type(Arc::new(ServiceDefinition::new(
        ECHO_SERVICE_TYPE,
        Duration::from_millis(settings.echo_timeout_ms),
        echo_service,
    )))?;
    server.add_service_type(Arc::new(ServiceDefinition::new(
        ACCUMULATOR_SERVICE_TYPE,
        Duration::from_millis(settings.accumulator_timeout_ms),
        accumulator_service,
    )))?;
    info!(
        "[内置服务] 已注册服务类型: {}, {}",
        ECHO_SERVICE_TYPE, ACCUMULATOR_SERVICE_TYPE
    );
    Ok(())
}

// service_conversation/src/server/dispatcher.rs

//! 会话分发器：`ConversationServer`。
//!
//! 负责：
//! - 服务类型的注册；
//! - 按客户端 ID 登记/注销响应（出站）传输；
//! - 启动会话：创建服务实例并在专属任务上运行；
//! - 把入站消息路由到对应会话（去重、排序、终止）；
//! - 会话结束时的统一收尾，以及后台回收器的启停。

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use conversation_models::ConversationState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ConversationError, panic_failure_description, service_failure_description};
use crate::message::{ConversationMessage, MessageBody};
use crate::server::ConversationServerConfig;
use crate::server::conversation::{Conversation, Interrupt};
use crate::server::messenger::ServiceMessenger;
use crate::server::reaper::ConversationReaper;
use crate::server::service::{ConversationService, ServiceFactory};
use crate::transport::{MessageTransport, RemoteConversationServer};

/// 客户端 ID -> 该客户端的响应传输。
pub type ClientTransports = DashMap<String, Arc<dyn MessageTransport>>;

struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ServerShared {
    config: ConversationServerConfig,
    service_types: DashMap<String, Arc<dyn ServiceFactory>>,
    conversations: DashMap<String, Arc<Conversation>>,
    client_transports: Arc<ClientTransports>,
    reaper: Mutex<Option<ReaperHandle>>,
}

/// 会话服务端。克隆代价很低，所有克隆共享同一份状态。
#[derive(Clone)]
pub struct ConversationServer {
    shared: Arc<ServerShared>,
}

impl Default for ConversationServer {
    fn default() -> Self {
        Self::new(ConversationServerConfig::default())
    }
}

impl ConversationServer {
    pub fn new(config: ConversationServerConfig) -> Self {
        info!(
            "[会话服务端] 创建新的 ConversationServer 实例。回收器周期上限: {:?}",
            config.reaper_interval
        );
        Self {
            shared: Arc::new(ServerShared {
                config,
                service_types: DashMap::new(),
                conversations: DashMap::new(),
                client_transports: Arc::new(ClientTransports::new()),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConversationServerConfig {
        &self.shared.config
    }

    /// 注册一个服务类型。同一 ID 重复注册返回 `DuplicateServiceType`。
    pub fn add_service_type(&self, factory: Arc<dyn ServiceFactory>) -> Result<(), ConversationError> {
        let service_type_id = factory.service_type_id().to_string();
        match self.shared.service_types.entry(service_type_id.clone()) {
            Entry::Occupied(_) => {
                error!("[会话服务端] 服务类型 '{}' 已注册，拒绝重复注册。", service_type_id);
                Err(ConversationError::DuplicateServiceType(service_type_id))
            }
            Entry::Vacant(slot) => {
                info!(
                    "[会话服务端] 注册服务类型 '{}'，客户端超时: {:?}",
                    service_type_id,
                    factory.client_timeout()
                );
                slot.insert(factory);
                Ok(())
            }
        }
    }

    pub fn has_service_type(&self, service_type_id: &str) -> bool {
        self.shared.service_types.contains_key(service_type_id)
    }

    /// 登记客户端的响应传输；同一客户端再次登记会替换旧的传输。
    pub fn add_client_response_transport(
        &self,
        client_id: impl Into<String>,
        transport: Arc<dyn MessageTransport>,
    ) {
        let client_id = client_id.into();
        info!("[会话服务端] 登记客户端 {} 的响应传输。", client_id);
        self.shared.client_transports.insert(client_id, transport);
    }

    /// 注销客户端的响应传输。该客户端已有的会话不受影响，之后由超时或终止回收。
    pub fn remove_client_response_transport(&self, client_id: &str) -> bool {
        let removed = self.shared.client_transports.remove(client_id).is_some();
        if removed {
            info!("[会话服务端] 注销客户端 {} 的响应传输。", client_id);
        } else {
            warn!("[会话服务端] 尝试注销不存在的客户端传输: {}", client_id);
        }
        removed
    }

    /// 仅当当前登记的传输就是 `transport` 时才注销，避免误删同一客户端重连后登记的新传输。
    pub(crate) fn remove_client_response_transport_if_same(
        &self,
        client_id: &str,
        transport: &Arc<dyn MessageTransport>,
    ) -> bool {
        let removed = self
            .shared
            .client_transports
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, transport))
            .is_some();
        if removed {
            info!("[会话服务端] 客户端 {} 断开，已注销其响应传输。", client_id);
        }
        removed
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.shared.client_transports.contains_key(client_id)
    }

    /// 启动一个会话并立即返回会话 ID；服务实例在后台任务中异步开始运行。
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn start_conversation(
        &self,
        service_type_id: &str,
        client_id: &str,
    ) -> Result<String, ConversationError> {
        let factory = self
            .shared
            .service_types
            .get(service_type_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConversationError::UnknownServiceType(service_type_id.to_string()))?;

        if !self.has_client(client_id) {
            return Err(ConversationError::UnknownClient(client_id.to_string()));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConversationError::RuntimeUnavailable(e.to_string()))?;

        let conversation_id = format!(
            "{}--{}--{}",
            client_id,
            service_type_id,
            Uuid::new_v4().simple()
        );
        let (conversation, inbox) = Conversation::new(
            conversation_id.clone(),
            client_id.to_string(),
            service_type_id.to_string(),
            factory.client_timeout(),
            factory.interrupt_on_client_exception(),
            self.shared.config.max_buffered_messages,
        );
        let service = factory.create();
        let messenger = ServiceMessenger::new(
            Arc::clone(&conversation),
            inbox,
            Arc::clone(&self.shared.client_transports),
        );

        self.shared
            .conversations
            .insert(conversation_id.clone(), Arc::clone(&conversation));
        info!(
            "[会话服务端] 为客户端 {} 启动 '{}' 会话: {}",
            client_id, service_type_id, conversation_id
        );

        let server = self.clone();
        runtime.spawn(async move {
            server.supervise(conversation, service, messenger).await;
        });
        Ok(conversation_id)
    }

    /// 在专属任务上运行服务，并根据其结束方式收尾。
    async fn supervise(
        self,
        conversation: Arc<Conversation>,
        service: Box<dyn ConversationService>,
        messenger: ServiceMessenger,
    ) {
        conversation.transition(ConversationState::Running);
        let outcome = tokio::spawn(service.run(messenger)).await;

        let failure = match outcome {
            Ok(Ok(())) => {
                debug!("[会话服务端] 会话 {} 的服务正常返回。", conversation.id());
                None
            }
            Ok(Err(err)) => match err.downcast_ref::<ConversationError>() {
                Some(e) if e.is_terminated() || e.is_client_timeout() => {
                    debug!("[会话服务端] 会话 {} 的服务因中断退出: {}", conversation.id(), e);
                    None
                }
                _ => Some(service_failure_description(&err)),
            },
            Err(join_err) if join_err.is_panic() => {
                Some(panic_failure_description(&panic_message(join_err.into_panic())))
            }
            Err(join_err) => {
                debug!("[会话服务端] 会话 {} 的服务任务被取消: {}", conversation.id(), join_err);
                None
            }
        };

        match failure {
            Some(description) if !conversation.state().is_terminal() => {
                warn!(
                    "[会话服务端] 会话 {} 的服务执行失败: {}",
                    conversation.id(),
                    description
                );
                let exception = ConversationMessage::exception(
                    conversation.id(),
                    conversation.next_outbound_index(),
                    description.clone(),
                );
                conversation.record_failure(description);
                if let Err(e) = conversation.send_outbound(&self.shared.client_transports, exception) {
                    warn!(
                        "[会话服务端] 无法把会话 {} 的失败通知客户端: {}",
                        conversation.id(),
                        e
                    );
                }
                self.finish(&conversation, ConversationState::Failed, Interrupt::Terminated);
            }
            _ => self.finish(&conversation, ConversationState::Closed, Interrupt::Terminated),
        }
    }

    /// 会话进入终止状态：迁移状态、中断服务任务、从会话表移除。
    fn finish(&self, conversation: &Arc<Conversation>, state: ConversationState, cause: Interrupt) {
        conversation.transition(state);
        conversation.interrupt(cause);
        if self.shared.conversations.remove(conversation.id()).is_some() {
            info!(
                "[会话服务端] 会话 {} 已移除，最终状态: {}",
                conversation.id(),
                conversation.state()
            );
        }
    }

    /// 回收器判定超时后调用：通知客户端、中断服务、移除会话。
    pub(crate) fn time_out_conversation(&self, conversation: &Arc<Conversation>) {
        let timeout_ms = conversation.client_timeout().as_millis() as u64;
        // 已处于终止状态（例如出站投递失败）的会话不再通知客户端，但仍需中断并移除
        if conversation.transition(ConversationState::TimedOut) {
            let description = ConversationError::ClientTimeout {
                conversation_id: conversation.id().to_string(),
                timeout_ms,
            }
            .to_string();
            conversation.record_failure(description.clone());
            let exception = ConversationMessage::exception(
                conversation.id(),
                conversation.next_outbound_index(),
                description,
            );
            if let Err(e) = conversation.send_outbound(&self.shared.client_transports, exception) {
                debug!(
                    "[会话服务端] 无法把超时通知发给会话 {} 的客户端: {}",
                    conversation.id(),
                    e
                );
            }
        }
        self.finish(conversation, ConversationState::TimedOut, Interrupt::ClientTimeout { timeout_ms });
    }

    /// 入站消息入口。
    fn handle_incoming(&self, message: ConversationMessage) {
        let conversation = self
            .shared
            .conversations
            .get(&message.conversation_id)
            .map(|entry| Arc::clone(entry.value()));
        let Some(conversation) = conversation else {
            debug!(
                "[会话服务端] 会话 {} 不存在（可能已结束），丢弃消息 #{}",
                message.conversation_id, message.message_index
            );
            return;
        };

        match &message.body {
            MessageBody::Terminate => {
                info!("[会话服务端] 会话 {} 收到终止哨兵。", conversation.id());
                self.finish(&conversation, ConversationState::Closed, Interrupt::Terminated);
            }
            MessageBody::Exception(description) if conversation.interrupt_on_client_exception() => {
                warn!(
                    "[会话服务端] 会话 {} 的客户端报告错误，立即中断服务: {}",
                    conversation.id(),
                    description
                );
                conversation.record_failure(format!("客户端错误: {}", description));
                self.finish(
                    &conversation,
                    ConversationState::Failed,
                    Interrupt::ClientException(description.clone()),
                );
            }
            _ => {
                conversation.deliver_inbound(message);
            }
        }
    }

    /// 返回接收客户端->服务端消息的传输。
    pub fn incoming_message_transport(&self) -> Arc<dyn MessageTransport> {
        Arc::new(IncomingMessageTransport {
            server: self.clone(),
        })
    }

    pub fn has_conversation(&self, conversation_id: &str) -> bool {
        self.shared.conversations.contains_key(conversation_id)
    }

    pub fn conversation_count(&self) -> usize {
        self.shared.conversations.len()
    }

    /// 仍在会话表中的会话状态；已移除的会话返回 `None`。
    pub fn conversation_state(&self, conversation_id: &str) -> Option<ConversationState> {
        self.shared
            .conversations
            .get(conversation_id)
            .map(|entry| entry.value().state())
    }

    /// 当前会话表的快照。
    pub(crate) fn conversations_snapshot(&self) -> Vec<Arc<Conversation>> {
        self.shared
            .conversations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 回收器实际使用的检查周期：配置上限与最小客户端超时中的较小者，至少 1 毫秒。
    pub fn effective_reaper_interval(&self) -> Duration {
        let min_timeout = self
            .shared
            .service_types
            .iter()
            .map(|entry| entry.value().client_timeout())
            .min();
        let interval = match min_timeout {
            Some(timeout) => timeout.min(self.shared.config.reaper_interval),
            None => self.shared.config.reaper_interval,
        };
        interval.max(Duration::from_millis(1))
    }

    /// 启动后台回收器。重复调用无副作用。必须在 tokio 运行时内调用。
    pub fn start(&self) -> Result<(), ConversationError> {
        let mut reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConversationError::RuntimeUnavailable(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(ConversationReaper::new(self.clone()).run(shutdown_rx));
        *reaper = Some(ReaperHandle { shutdown_tx, task });
        info!("[会话服务端] 回收器已启动。");
        Ok(())
    }

    /// 停止回收器并关闭所有仍在运行的会话。
    pub async fn shutdown(&self) {
        let reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            let _ = reaper.shutdown_tx.send(true);
            if let Err(e) = reaper.task.await {
                warn!("[会话服务端] 等待回收器结束时出错: {}", e);
            }
        }
        let conversations = self.conversations_snapshot();
        info!("[会话服务端] 正在关闭，剩余会话数: {}", conversations.len());
        for conversation in conversations {
            self.finish(&conversation, ConversationState::Closed, Interrupt::Terminated);
        }
    }
}

impl RemoteConversationServer for ConversationServer {
    fn start_conversation<'a>(
        &'a self,
        service_type_id: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<String, ConversationError>> {
        Box::pin(std::future::ready(ConversationServer::start_conversation(
            self,
            service_type_id,
            client_id,
        )))
    }
}

struct IncomingMessageTransport {
    server: ConversationServer,
}

impl MessageTransport for IncomingMessageTransport {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        self.server.handle_incoming(message);
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// service_conversation/src/server/messenger.rs

//! 服务任务内部使用的收发门面。

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::error::ConversationError;
use crate::message::{ConversationMessage, MessageBody};
use crate::server::conversation::{Conversation, ConversationInbox, Interrupt};
use crate::server::dispatcher::ClientTransports;

/// `ServiceMessenger` 绑定到一个会话，只在该会话的服务任务中使用。
///
/// - `receive`/`try_receive` 等待入站消息或中断；
/// - `send` 为出站消息分配序号，并交给该客户端登记的响应传输。
///
/// 中断优先于排队中的消息：会话被终止或超时后，`receive` 立即返回对应错误。
pub struct ServiceMessenger {
    conversation: Arc<Conversation>,
    inbox: ConversationInbox,
    transports: Arc<ClientTransports>,
}

impl ServiceMessenger {
    pub(crate) fn new(
        conversation: Arc<Conversation>,
        inbox: ConversationInbox,
        transports: Arc<ClientTransports>,
    ) -> Self {
        Self {
            conversation,
            inbox,
            transports,
        }
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.id()
    }

    pub fn client_id(&self) -> &str {
        self.conversation.client_id()
    }

    /// 会话是否已被中断（终止、超时或客户端错误）。
    pub fn is_interrupted(&self) -> bool {
        self.inbox.interrupts.borrow().is_some()
    }

    fn pending_interrupt(&self) -> Option<ConversationError> {
        let cause: Option<Interrupt> = self.inbox.interrupts.borrow().clone();
        cause.map(|cause| cause.to_error(self.conversation.id()))
    }

    /// 等待下一条入站消息并解码为 `T`。
    ///
    /// # Errors
    /// - `ClientExecution`: 客户端报告了错误；
    /// - `Terminated`: 会话被终止（应视为正常退出）；
    /// - `ClientTimeout`: 回收器判定客户端超时；
    /// - `DeserializationError`: 负载与 `T` 不匹配。
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, ConversationError> {
        match self.next_message(None).await? {
            Some(message) => self.decode(message),
            None => Err(ConversationError::ConversationClosed(
                self.conversation.id().to_string(),
            )),
        }
    }

    /// 与 `receive` 相同，但在 `timeout` 内没有消息时返回 `Ok(None)`。
    /// `Duration::ZERO` 表示只检查一次，不等待。
    pub async fn try_receive<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<T>, ConversationError> {
        match self.next_message(Some(timeout)).await? {
            Some(message) => self.decode(message).map(Some),
            None => Ok(None),
        }
    }

    async fn next_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ConversationMessage>, ConversationError> {
        if let Some(err) = self.pending_interrupt() {
            return Err(err);
        }

        if timeout == Some(Duration::ZERO) {
            return match self.inbox.messages.try_recv() {
                Ok(message) => Ok(Some(message)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(ConversationError::ConversationClosed(
                    self.conversation.id().to_string(),
                )),
            };
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                changed = self.inbox.interrupts.changed() => {
                    if changed.is_err() {
                        return Err(ConversationError::ConversationClosed(
                            self.conversation.id().to_string(),
                        ));
                    }
                    if let Some(err) = self.pending_interrupt() {
                        return Err(err);
                    }
                }
                message = self.inbox.messages.recv() => {
                    return match message {
                        Some(message) => Ok(Some(message)),
                        None => Err(ConversationError::ConversationClosed(
                            self.conversation.id().to_string(),
                        )),
                    };
                }
                _ = expired => {
                    debug!("[服务信使 {}] 等待入站消息超时。", self.conversation.id());
                    return Ok(None);
                }
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, message: ConversationMessage) -> Result<T, ConversationError> {
        match &message.body {
            MessageBody::Payload(_) => message.deserialize_payload(),
            MessageBody::Exception(description) => Err(ConversationError::ClientExecution {
                conversation_id: self.conversation.id().to_string(),
                description: description.clone(),
            }),
            MessageBody::Terminate => Err(ConversationError::Terminated {
                conversation_id: self.conversation.id().to_string(),
            }),
        }
    }

    /// 发送一条负载消息给客户端。
    ///
    /// 投递失败会被记录为会话的服务端错误状态。
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), ConversationError> {
        if let Some(err) = self.pending_interrupt() {
            return Err(err);
        }
        // 先序列化再分配序号，避免序列化失败在出站序列中留下空洞
        let mut message = ConversationMessage::payload(self.conversation.id(), 0, payload)?;
        message.message_index = self.conversation.next_outbound_index();
        self.conversation.send_outbound(&self.transports, message)
    }
}

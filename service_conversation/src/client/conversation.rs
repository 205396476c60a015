// service_conversation/src/client/conversation.rs

//! 客户端会话句柄。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::client::conversation_client::{ClientSlot, ClientSlots};
use crate::error::ConversationError;
use crate::message::{ConversationMessage, MessageBody};
use crate::sequencer::{SequenceDecision, Sequencer};
use crate::transport::MessageTransport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 服务端 -> 客户端方向的接收状态，由路由器和句柄共享。
#[derive(Debug)]
pub(crate) struct ClientChannel {
    conversation_id: String,
    inbound: Mutex<Sequencer<ConversationMessage>>,
    inbound_tx: mpsc::UnboundedSender<ConversationMessage>,
    /// 服务端报告的失败描述；一旦记录，后续 `send` 直接失败。
    server_failure: Mutex<Option<String>>,
}

impl ClientChannel {
    pub(crate) fn new(
        conversation_id: String,
        max_buffered: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConversationMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            conversation_id,
            inbound: Mutex::new(Sequencer::new(max_buffered)),
            inbound_tx,
            server_failure: Mutex::new(None),
        });
        (channel, inbound_rx)
    }

    /// 对服务端回送的消息做排序判定并交付给句柄。返回交付条数。
    pub(crate) fn deliver(&self, message: ConversationMessage) -> usize {
        if message.is_terminate() {
            debug!("[客户端会话 {}] 忽略服务端发来的终止哨兵。", self.conversation_id);
            return 0;
        }
        let index = message.message_index;
        let mut sequencer = lock(&self.inbound);
        match sequencer.accept(index, message) {
            SequenceDecision::Deliver(ready) => {
                let count = ready.len();
                for message in ready {
                    if let Some(description) = message.exception_description() {
                        let mut failure = lock(&self.server_failure);
                        if failure.is_none() {
                            *failure = Some(description.to_string());
                        }
                    }
                    if self.inbound_tx.send(message).is_err() {
                        debug!("[客户端会话 {}] 句柄已关闭，丢弃回送消息。", self.conversation_id);
                    }
                }
                count
            }
            SequenceDecision::Duplicate => {
                debug!("[客户端会话 {}] 丢弃重复的回送消息 #{}", self.conversation_id, index);
                0
            }
            SequenceDecision::Buffered { expected } => {
                debug!(
                    "[客户端会话 {}] 回送消息 #{} 超前（期望 #{}），已缓冲。",
                    self.conversation_id, index, expected
                );
                0
            }
            SequenceDecision::Rejected { expected, received } => {
                warn!(
                    "[客户端会话 {}] 协议违规：回送消息 #{} 超前于 #{} 且缓冲区已满，已丢弃。",
                    self.conversation_id, received, expected
                );
                0
            }
        }
    }

    pub(crate) fn server_failure(&self) -> Option<String> {
        lock(&self.server_failure).clone()
    }
}

/// 绑定到一个会话 ID 的客户端句柄。
///
/// 出站序号由句柄自己维护；入站消息经 `ConversationClient` 的路由器去重排序后进入句柄的队列。
pub struct ClientConversation {
    channel: Arc<ClientChannel>,
    inbound_rx: mpsc::UnboundedReceiver<ConversationMessage>,
    outbound: Arc<dyn MessageTransport>,
    slots: Arc<ClientSlots>,
    next_outbound: u64,
    receive_timeout: Duration,
    closed: bool,
}

impl ClientConversation {
    pub(crate) fn new(
        channel: Arc<ClientChannel>,
        inbound_rx: mpsc::UnboundedReceiver<ConversationMessage>,
        outbound: Arc<dyn MessageTransport>,
        slots: Arc<ClientSlots>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            inbound_rx,
            outbound,
            slots,
            next_outbound: 0,
            receive_timeout,
            closed: false,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.channel.conversation_id
    }

    fn ensure_open(&self) -> Result<(), ConversationError> {
        if self.closed {
            return Err(ConversationError::ConversationClosed(
                self.conversation_id().to_string(),
            ));
        }
        Ok(())
    }

    fn service_failure(&self) -> Option<ConversationError> {
        self.channel
            .server_failure()
            .map(|description| ConversationError::ServiceExecution {
                conversation_id: self.conversation_id().to_string(),
                description,
            })
    }

    fn send_next(&mut self, mut message: ConversationMessage) -> Result<(), ConversationError> {
        message.message_index = self.next_outbound;
        self.outbound.send(message)?;
        self.next_outbound += 1;
        Ok(())
    }

    /// 发送一条负载消息。服务端已报告失败时直接返回 `ServiceExecution`，不再发送。
    pub fn send<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<(), ConversationError> {
        self.ensure_open()?;
        if let Some(err) = self.service_failure() {
            return Err(err);
        }
        let message = ConversationMessage::payload(self.conversation_id(), 0, payload)?;
        self.send_next(message)
    }

    /// 把客户端一侧的错误报告给服务端；服务任务在 `receive` 中以 `ClientExecution` 收到。
    pub fn report_error(&mut self, description: impl Into<String>) -> Result<(), ConversationError> {
        self.ensure_open()?;
        let message = ConversationMessage::exception(self.conversation_id(), 0, description);
        self.send_next(message)
    }

    /// 在默认的接收超时内等待服务端回复。
    ///
    /// # Errors
    /// - `ServiceExecution`: 服务端报告了失败（包括客户端超时）；
    /// - `Timeout`: 等待超时，服务端状态不受影响；
    /// - `DeserializationError`: 负载与 `T` 不匹配。
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, ConversationError> {
        let timeout = self.receive_timeout;
        self.receive_with_timeout(timeout).await
    }

    /// 与 `receive` 相同，使用显式的等待时长。
    pub async fn receive_with_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<T, ConversationError> {
        match self.try_receive(timeout).await? {
            Some(value) => Ok(value),
            None => Err(ConversationError::Timeout {
                conversation_id: self.conversation_id().to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// 在 `timeout` 内没有消息时返回 `Ok(None)`；`Duration::ZERO` 表示只检查一次。
    pub async fn try_receive<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<T>, ConversationError> {
        self.ensure_open()?;
        let message = if timeout.is_zero() {
            match self.inbound_rx.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    return Err(ConversationError::ConversationClosed(
                        self.conversation_id().to_string(),
                    ));
                }
            }
        } else {
            match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
                Ok(Some(message)) => Some(message),
                Ok(None) => {
                    return Err(ConversationError::ConversationClosed(
                        self.conversation_id().to_string(),
                    ));
                }
                Err(_) => None,
            }
        };
        message.map(|message| self.decode(message)).transpose()
    }

    fn decode<T: DeserializeOwned>(&self, message: ConversationMessage) -> Result<T, ConversationError> {
        match &message.body {
            MessageBody::Payload(_) => message.deserialize_payload(),
            MessageBody::Exception(description) => Err(ConversationError::ServiceExecution {
                conversation_id: self.conversation_id().to_string(),
                description: description.clone(),
            }),
            MessageBody::Terminate => Err(ConversationError::Terminated {
                conversation_id: self.conversation_id().to_string(),
            }),
        }
    }

    /// 向服务端发送终止哨兵，不等待确认。
    pub fn terminate(&self) -> Result<(), ConversationError> {
        debug!("[客户端会话 {}] 发送终止哨兵。", self.conversation_id());
        self.outbound
            .send(ConversationMessage::terminate(self.conversation_id()))
    }

    /// 释放本地资源。不会通知服务端，需要结束服务端会话时先调用 `terminate`。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbound_rx.close();
        // 只移除本句柄自己的条目；之后到达的迟到消息会作为暂存在 pending_ttl 后被清除
        let channel = &self.channel;
        self.slots.remove_if(self.conversation_id(), |_, slot| {
            matches!(slot, ClientSlot::Active(active) if Arc::ptr_eq(active, channel))
        });
        debug!("[客户端会话 {}] 本地句柄已关闭。", self.conversation_id());
    }
}

impl Drop for ClientConversation {
    fn drop(&mut self) {
        self.close();
    }
}

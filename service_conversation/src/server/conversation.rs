// service_conversation/src/server/conversation.rs

//! 单个会话在服务端的状态。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use conversation_models::ConversationState;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::error::ConversationError;
use crate::message::ConversationMessage;
use crate::sequencer::{SequenceDecision, Sequencer};
use crate::server::dispatcher::ClientTransports;

/// 中断服务任务的原因。第一次中断生效，之后的中断被忽略。
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// 收到终止哨兵，或服务端关闭。
    Terminated,
    /// 回收器检测到客户端超时。
    ClientTimeout { timeout_ms: u64 },
    /// 客户端报告错误，且服务类型要求立即中断。
    ClientException(String),
}

impl Interrupt {
    /// 转换为服务任务内 `receive` 抛出的错误。
    pub fn to_error(&self, conversation_id: &str) -> ConversationError {
        match self {
            Interrupt::Terminated => ConversationError::Terminated {
                conversation_id: conversation_id.to_string(),
            },
            Interrupt::ClientTimeout { timeout_ms } => ConversationError::ClientTimeout {
                conversation_id: conversation_id.to_string(),
                timeout_ms: *timeout_ms,
            },
            Interrupt::ClientException(description) => ConversationError::ClientExecution {
                conversation_id: conversation_id.to_string(),
                description: description.clone(),
            },
        }
    }
}

/// 服务任务一侧持有的接收端：入站消息队列和中断信号。
pub(crate) struct ConversationInbox {
    pub(crate) messages: mpsc::UnboundedReceiver<ConversationMessage>,
    pub(crate) interrupts: watch::Receiver<Option<Interrupt>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 服务端会话。
///
/// 会话表、服务任务和回收器共享同一个 `Arc<Conversation>`；
/// 入站排序器的锁只在一次接收判定期间持有，不会跨越任何 `.await`。
#[derive(Debug)]
pub struct Conversation {
    id: String,
    client_id: String,
    service_type_id: String,
    client_timeout: Duration,
    interrupt_on_client_exception: bool,
    inbound: Mutex<Sequencer<ConversationMessage>>,
    inbound_tx: mpsc::UnboundedSender<ConversationMessage>,
    next_outbound: AtomicU64,
    /// 最后一次接受入站消息的 UTC 毫秒时间戳。出站消息不刷新它。
    last_activity_ms: AtomicI64,
    state: Mutex<ConversationState>,
    failure: Mutex<Option<String>>,
    interrupt_tx: watch::Sender<Option<Interrupt>>,
}

impl Conversation {
    pub(crate) fn new(
        id: String,
        client_id: String,
        service_type_id: String,
        client_timeout: Duration,
        interrupt_on_client_exception: bool,
        max_buffered: usize,
    ) -> (Arc<Self>, ConversationInbox) {
        let (inbound_tx, messages) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupts) = watch::channel(None);
        let conversation = Arc::new(Self {
            id,
            client_id,
            service_type_id,
            client_timeout,
            interrupt_on_client_exception,
            inbound: Mutex::new(Sequencer::new(max_buffered)),
            inbound_tx,
            next_outbound: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            state: Mutex::new(ConversationState::Created),
            failure: Mutex::new(None),
            interrupt_tx,
        });
        (conversation, ConversationInbox { messages, interrupts })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn service_type_id(&self) -> &str {
        &self.service_type_id
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn interrupt_on_client_exception(&self) -> bool {
        self.interrupt_on_client_exception
    }

    pub fn state(&self) -> ConversationState {
        *lock(&self.state)
    }

    /// 记录的服务端错误描述（服务失败或出站投递失败）。
    pub fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    pub(crate) fn record_failure(&self, description: impl Into<String>) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(description.into());
        }
    }

    /// 迁移到 `to`。终止状态一旦到达便不再改变；返回是否发生了迁移。
    pub(crate) fn transition(&self, to: ConversationState) -> bool {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return false;
        }
        debug!("[会话 {}] 状态迁移: {} -> {}", self.id, *state, to);
        *state = to;
        true
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// 以 `now_ms` 为基准，客户端是否已超时。
    pub fn is_idle_past_timeout(&self, now_ms: i64) -> bool {
        let idle_ms = now_ms.saturating_sub(self.last_activity_ms());
        idle_ms > self.client_timeout.as_millis() as i64
    }

    /// 分配下一个出站序号。
    pub(crate) fn next_outbound_index(&self) -> u64 {
        self.next_outbound.fetch_add(1, Ordering::SeqCst)
    }

    /// 对一条入站消息做排序判定，按序交付到服务任务的队列。返回交付的消息条数。
    pub(crate) fn deliver_inbound(&self, message: ConversationMessage) -> usize {
        let index = message.message_index;
        let mut sequencer = lock(&self.inbound);
        match sequencer.accept(index, message) {
            SequenceDecision::Deliver(ready) => {
                let count = ready.len();
                for message in ready {
                    if self.inbound_tx.send(message).is_err() {
                        debug!("[会话 {}] 服务任务已结束，丢弃入站消息。", self.id);
                    }
                }
                self.touch();
                count
            }
            SequenceDecision::Duplicate => {
                debug!("[会话 {}] 丢弃重复的入站消息 #{}", self.id, index);
                0
            }
            SequenceDecision::Buffered { expected } => {
                debug!(
                    "[会话 {}] 入站消息 #{} 超前（期望 #{}），已缓冲。",
                    self.id, index, expected
                );
                0
            }
            SequenceDecision::Rejected { expected, received } => {
                warn!(
                    "[会话 {}] 协议违规：入站消息 #{} 超前于 #{} 且缓冲区已满，已丢弃。",
                    self.id, received, expected
                );
                0
            }
        }
    }

    /// 中断服务任务。只有第一次中断生效。
    pub(crate) fn interrupt(&self, cause: Interrupt) {
        let applied = self.interrupt_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause.clone());
                true
            } else {
                false
            }
        });
        if applied {
            debug!("[会话 {}] 服务任务已被中断: {:?}", self.id, cause);
        }
    }

    pub fn interrupt_cause(&self) -> Option<Interrupt> {
        self.interrupt_tx.borrow().clone()
    }

    /// 通过该客户端登记的响应传输发送一条出站消息。
    ///
    /// 找不到传输或传输出错时，把错误记录为会话的服务端错误状态并返回错误。
    pub(crate) fn send_outbound(
        &self,
        transports: &ClientTransports,
        message: ConversationMessage,
    ) -> Result<(), ConversationError> {
        let transport = transports
            .get(&self.client_id)
            .map(|entry| Arc::clone(entry.value()));
        let result = match transport {
            Some(transport) => transport.send(message),
            None => Err(ConversationError::UnknownClient(self.client_id.clone())),
        };
        if let Err(e) = &result {
            warn!(
                "[会话 {}] 向客户端 {} 发送消息失败: {}",
                self.id, self.client_id, e
            );
            self.record_failure(e.to_string());
            self.transition(ConversationState::Failed);
        }
        result
    }
}

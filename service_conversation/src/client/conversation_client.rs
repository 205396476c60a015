// service_conversation/src/client/conversation_client.rs

//! `ConversationClient`：客户端一侧的会话入口。
//!
//! 服务端回送的消息可能早于 `start_conversation` 返回就到达（服务实例一启动就可以发送），
//! 因此路由表为尚未领取的会话 ID 暂存消息，句柄创建时再按序交付。
//! 暂存超过 `ClientConfig::pending_ttl` 仍未被领取的条目会被清除；句柄关闭时移除其条目。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::client::ClientConfig;
use crate::client::conversation::{ClientChannel, ClientConversation};
use crate::error::ConversationError;
use crate::message::ConversationMessage;
use crate::transport::{MessageTransport, RemoteConversationServer};

/// 路由表中某个会话 ID 的状态。
#[derive(Debug)]
pub(crate) enum ClientSlot {
    /// 句柄已创建，消息直接交付。
    Active(Arc<ClientChannel>),
    /// 句柄尚未创建，消息暂存。`since` 为第一条消息到达的时间。
    Pending {
        messages: Vec<ConversationMessage>,
        since: Instant,
    },
}

pub(crate) type ClientSlots = DashMap<String, ClientSlot>;

/// 清除暂存超过 `ttl` 的条目，返回清除数。
fn prune_expired_pending(slots: &ClientSlots, ttl: Duration) -> usize {
    let before = slots.len();
    slots.retain(|conversation_id, slot| match slot {
        ClientSlot::Pending { messages, since } if since.elapsed() >= ttl => {
            debug!(
                "[会话客户端] 会话 {} 的 {} 条暂存消息超时未被领取，已丢弃。",
                conversation_id,
                messages.len()
            );
            false
        }
        _ => true,
    });
    before.saturating_sub(slots.len())
}

/// 会话客户端。克隆共享同一张路由表。
#[derive(Clone)]
pub struct ConversationClient {
    client_id: String,
    remote: Arc<dyn RemoteConversationServer>,
    outbound: Arc<dyn MessageTransport>,
    slots: Arc<ClientSlots>,
    config: ClientConfig,
}

impl ConversationClient {
    /// # Arguments
    /// * `client_id` - 客户端 ID，需与服务端登记响应传输时使用的 ID 一致；
    /// * `remote` - 启动会话的远程调用；
    /// * `outbound` - 客户端 -> 服务端方向的传输。
    pub fn new(
        client_id: impl Into<String>,
        remote: Arc<dyn RemoteConversationServer>,
        outbound: Arc<dyn MessageTransport>,
    ) -> Self {
        Self::with_config(client_id, remote, outbound, ClientConfig::default())
    }

    pub fn with_config(
        client_id: impl Into<String>,
        remote: Arc<dyn RemoteConversationServer>,
        outbound: Arc<dyn MessageTransport>,
        config: ClientConfig,
    ) -> Self {
        let client_id = client_id.into();
        info!("[会话客户端] 创建客户端 {}", client_id);
        Self {
            client_id,
            remote,
            outbound,
            slots: Arc::new(ClientSlots::new()),
            config,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 路由表当前跟踪的会话 ID 数（打开的句柄加上未过期的暂存条目）。
    pub fn tracked_conversation_count(&self) -> usize {
        prune_expired_pending(&self.slots, self.config.pending_ttl);
        self.slots.len()
    }

    /// 返回接收服务端 -> 客户端消息的传输，应登记为服务端上本客户端的响应传输。
    pub fn incoming_response_transport(&self) -> Arc<dyn MessageTransport> {
        Arc::new(ResponseRouter {
            slots: Arc::clone(&self.slots),
            max_pending: self.config.max_buffered_messages,
            pending_ttl: self.config.pending_ttl,
        })
    }

    /// 请求服务端启动一个会话并返回绑定到该会话的句柄。
    ///
    /// # Errors
    /// 远程调用的错误原样返回，例如 `UnknownServiceType`、`UnknownClient`。
    pub async fn start_conversation(
        &self,
        service_type_id: &str,
    ) -> Result<ClientConversation, ConversationError> {
        let conversation_id = self
            .remote
            .start_conversation(service_type_id, &self.client_id)
            .await?;

        let (channel, inbound_rx) =
            ClientChannel::new(conversation_id.clone(), self.config.max_buffered_messages);
        let previous = self
            .slots
            .insert(conversation_id.clone(), ClientSlot::Active(Arc::clone(&channel)));
        if let Some(ClientSlot::Pending { messages, .. }) = previous {
            debug!(
                "[会话客户端] 会话 {} 有 {} 条提前到达的消息，补交给句柄。",
                conversation_id,
                messages.len()
            );
            for message in messages {
                channel.deliver(message);
            }
        }
        info!(
            "[会话客户端] 客户端 {} 已启动 '{}' 会话: {}",
            self.client_id, service_type_id, conversation_id
        );

        Ok(ClientConversation::new(
            channel,
            inbound_rx,
            Arc::clone(&self.outbound),
            Arc::clone(&self.slots),
            self.config.receive_timeout,
        ))
    }
}

/// 把服务端回送的消息按会话 ID 分发到句柄。
struct ResponseRouter {
    slots: Arc<ClientSlots>,
    max_pending: usize,
    pending_ttl: Duration,
}

impl MessageTransport for ResponseRouter {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        let channel = self.slots.get(&message.conversation_id).and_then(|entry| match entry.value() {
            ClientSlot::Active(channel) => Some(Arc::clone(channel)),
            ClientSlot::Pending { .. } => None,
        });
        if let Some(channel) = channel {
            channel.deliver(message);
            return Ok(());
        }

        // 新建暂存条目前先清理过期条目，使路由表只保留打开的句柄和近期的暂存
        if !self.slots.contains_key(&message.conversation_id) {
            prune_expired_pending(&self.slots, self.pending_ttl);
        }
        let mut entry = self
            .slots
            .entry(message.conversation_id.clone())
            .or_insert_with(|| ClientSlot::Pending {
                messages: Vec::new(),
                since: Instant::now(),
            });
        match entry.value_mut() {
            ClientSlot::Active(channel) => {
                let channel = Arc::clone(channel);
                drop(entry);
                channel.deliver(message);
            }
            ClientSlot::Pending { messages, .. } => {
                if messages.len() < self.max_pending {
                    messages.push(message);
                } else {
                    warn!(
                        "[会话客户端] 会话 {} 尚无句柄且暂存已满，丢弃消息 #{}",
                        message.conversation_id, message.message_index
                    );
                }
            }
        }
        Ok(())
    }
}

// service_conversation/src/client/ws_connector.rs

//! 通过 WebSocket 连接远端会话服务端。
//!
//! 连接建立后立即发送 `register_client`；之后：
//! - 写任务把出站信封写入 WebSocket；
//! - 读任务把 `start_conversation_result` 交给等待中的启动请求，
//!   把 `conversation_message` 交给客户端的入站传输。

use std::sync::Arc;
use std::time::Duration;

use conversation_models::payloads::{
    CONVERSATION_MESSAGE_TYPE, REGISTER_CLIENT_MESSAGE_TYPE, RegisterClientPayload,
    START_CONVERSATION_MESSAGE_TYPE, START_CONVERSATION_RESULT_MESSAGE_TYPE,
    StartConversationFailure, StartConversationRequest, StartConversationResponse,
};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use url::Url;

use crate::client::{ClientConfig, ConversationClient};
use crate::error::ConversationError;
use crate::message::ConversationMessage;
use crate::transport::{ChannelTransport, MessageTransport, RemoteConversationServer};
use crate::wire::{WireEnvelope, receive_envelope};

type PendingStarts = DashMap<String, oneshot::Sender<StartConversationResponse>>;

/// 一条已注册的 WebSocket 连接。
///
/// 同时充当客户端的出站传输（`MessageTransport`）和启动会话的远程调用（`RemoteConversationServer`）。
pub struct WsConnection {
    client_id: String,
    outgoing: mpsc::UnboundedSender<WireEnvelope>,
    pending_starts: Arc<PendingStarts>,
    start_timeout: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    /// 连接到 `url` 并以 `client_id` 注册。服务端回送的会话消息交给 `incoming`。
    ///
    /// # Errors
    /// - `InvalidUrl`: URL 无法解析；
    /// - `WebSocketProtocolError`: 连接或握手失败。
    pub async fn connect(
        url: &str,
        client_id: impl Into<String>,
        incoming: Arc<dyn MessageTransport>,
        config: &ClientConfig,
    ) -> Result<Arc<Self>, ConversationError> {
        let client_id = client_id.into();
        info!("[WS连接器] 客户端 {} 正在连接: {}", client_id, url);
        let parsed_url = Url::parse(url)
            .map_err(|e| ConversationError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url, e)))?;

        let (ws_stream, response) = connect_async(parsed_url.as_str()).await.map_err(|e| {
            error!("[WS连接器] 连接到 {} 失败: {}", url, e);
            ConversationError::WebSocketProtocolError(e)
        })?;
        info!("[WS连接器] 已连接到 {} (HTTP 状态码: {})", url, response.status());

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let register = WireEnvelope::new(
            REGISTER_CLIENT_MESSAGE_TYPE,
            &RegisterClientPayload::new(client_id.clone()),
        )?;
        ws_sender.send(register.to_frame()?).await?;
        debug!("[WS连接器] 已发送注册消息，客户端 ID: {}", client_id);

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WireEnvelope>();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let frame = match envelope.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("[WS连接器] 编码出站信封失败: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(frame).await {
                    warn!("[WS连接器] 写入失败，连接可能已断开: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("[WS连接器] 写任务结束。");
        });

        let pending_starts: Arc<PendingStarts> = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending_starts);
        let reader = tokio::spawn(async move {
            while let Some(received) = receive_envelope(&mut ws_receiver).await {
                let envelope = match received {
                    Ok(envelope) => envelope,
                    Err(ConversationError::DeserializationError(e)) => {
                        warn!("[WS连接器] 无法解析的帧，已忽略: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("[WS连接器] 连接出错，停止读取: {}", e);
                        break;
                    }
                };
                match envelope.message_type.as_str() {
                    START_CONVERSATION_RESULT_MESSAGE_TYPE => {
                        match envelope.deserialize_payload::<StartConversationResponse>() {
                            Ok(response) => match reader_pending.remove(&response.request_id) {
                                Some((_, waiter)) => {
                                    let _ = waiter.send(response);
                                }
                                None => debug!(
                                    "[WS连接器] 启动请求 {} 已无人等待，丢弃结果。",
                                    response.request_id
                                ),
                            },
                            Err(e) => warn!("[WS连接器] 无效的启动会话结果: {}", e),
                        }
                    }
                    CONVERSATION_MESSAGE_TYPE => match envelope.deserialize_payload::<ConversationMessage>() {
                        Ok(message) => {
                            if let Err(e) = incoming.send(message) {
                                warn!("[WS连接器] 转交回送消息失败: {}", e);
                            }
                        }
                        Err(e) => warn!("[WS连接器] 无效的会话消息: {}", e),
                    },
                    other => warn!("[WS连接器] 未知消息类型 '{}'，已忽略。", other),
                }
            }
            // 丢弃等待者，使未完成的启动请求以 NotConnected 结束
            reader_pending.clear();
            info!("[WS连接器] 读任务结束，连接已关闭。");
        });

        Ok(Arc::new(Self {
            client_id,
            outgoing: outgoing_tx,
            pending_starts,
            start_timeout: config.start_timeout,
            writer,
            reader,
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// 读任务仍在运行即视为已连接。
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    /// 立即断开连接。未完成的启动请求返回 `NotConnected`。
    pub fn disconnect(&self) {
        info!("[WS连接器] 客户端 {} 主动断开连接。", self.client_id);
        self.reader.abort();
        self.writer.abort();
        self.pending_starts.clear();
    }

    async fn request_start(&self, service_type_id: &str) -> Result<String, ConversationError> {
        let request = StartConversationRequest::new(service_type_id);
        let request_id = request.request_id.clone();
        let envelope = WireEnvelope::new(START_CONVERSATION_MESSAGE_TYPE, &request)?;

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending_starts.insert(request_id.clone(), waiter_tx);
        if self.outgoing.send(envelope).is_err() {
            self.pending_starts.remove(&request_id);
            return Err(ConversationError::NotConnected);
        }

        let response = match tokio::time::timeout(self.start_timeout, waiter_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ConversationError::NotConnected),
            Err(_) => {
                self.pending_starts.remove(&request_id);
                return Err(ConversationError::Transport(format!(
                    "启动 '{}' 会话的请求在 {:?} 内未得到回复",
                    service_type_id, self.start_timeout
                )));
            }
        };

        match (response.conversation_id, response.error) {
            (_, Some(failure)) => Err(from_failure(failure)),
            (Some(conversation_id), None) => Ok(conversation_id),
            (None, None) => Err(ConversationError::Transport(
                "启动会话结果既没有会话 ID 也没有错误".to_string(),
            )),
        }
    }
}

impl MessageTransport for WsConnection {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        let envelope = WireEnvelope::new(CONVERSATION_MESSAGE_TYPE, &message)?;
        self.outgoing
            .send(envelope)
            .map_err(|_| ConversationError::NotConnected)
    }
}

impl RemoteConversationServer for WsConnection {
    fn start_conversation<'a>(
        &'a self,
        service_type_id: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<String, ConversationError>> {
        if client_id != self.client_id {
            warn!(
                "[WS连接器] 连接以 {} 注册，忽略请求中的客户端 ID {}",
                self.client_id, client_id
            );
        }
        Box::pin(self.request_start(service_type_id))
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn from_failure(failure: StartConversationFailure) -> ConversationError {
    match failure {
        StartConversationFailure::UnknownServiceType(id) => ConversationError::UnknownServiceType(id),
        StartConversationFailure::UnknownClient(id) => ConversationError::UnknownClient(id),
        StartConversationFailure::Other(detail) => ConversationError::Transport(detail),
    }
}

/// 连接远端服务端并返回可直接使用的 `ConversationClient`。
///
/// 返回的 `WsConnection` 可用于查询连接状态或主动断开。
pub async fn connect_client(
    url: &str,
    client_id: &str,
    config: ClientConfig,
) -> Result<(ConversationClient, Arc<WsConnection>), ConversationError> {
    let (incoming, mut incoming_rx) = ChannelTransport::new();
    let connection = WsConnection::connect(url, client_id, Arc::new(incoming), &config).await?;

    let remote: Arc<dyn RemoteConversationServer> = connection.clone();
    let outbound: Arc<dyn MessageTransport> = connection.clone();
    let client = ConversationClient::with_config(client_id, remote, outbound, config);

    let router = client.incoming_response_transport();
    tokio::spawn(async move {
        while let Some(message) = incoming_rx.recv().await {
            if let Err(e) = router.send(message) {
                warn!("[WS连接器] 路由回送消息失败: {}", e);
            }
        }
    });
    Ok((client, connection))
}

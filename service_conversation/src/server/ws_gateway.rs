// service_conversation/src/server/ws_gateway.rs

//! WebSocket 网关：把远端客户端接入 `ConversationServer`。
//!
//! 每个连接：
//! - 一个写任务从 mpsc 队列取出信封写入 WebSocket；
//! - 读循环要求第一条消息为 `register_client`，随后把该连接登记为客户端的响应传输；
//! - `start_conversation` 请求同步调用分发器并回复结果；
//! - `conversation_message` 交给分发器的入站传输；
//! - 连接断开时注销该客户端的响应传输，其会话随后由回收器按超时回收。

use std::net::SocketAddr;
use std::sync::Arc;

use conversation_models::payloads::{
    CONVERSATION_MESSAGE_TYPE, REGISTER_CLIENT_MESSAGE_TYPE, RegisterClientPayload,
    START_CONVERSATION_MESSAGE_TYPE, START_CONVERSATION_RESULT_MESSAGE_TYPE,
    StartConversationFailure, StartConversationRequest, StartConversationResponse,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;

use crate::error::ConversationError;
use crate::message::ConversationMessage;
use crate::server::dispatcher::ConversationServer;
use crate::transport::MessageTransport;
use crate::wire::{WireEnvelope, receive_envelope};

/// 通过某个 WebSocket 连接把会话消息回送给客户端的传输。
struct WsResponseTransport {
    outgoing: mpsc::UnboundedSender<WireEnvelope>,
}

impl MessageTransport for WsResponseTransport {
    fn send(&self, message: ConversationMessage) -> Result<(), ConversationError> {
        let envelope = WireEnvelope::new(CONVERSATION_MESSAGE_TYPE, &message)?;
        self.outgoing
            .send(envelope)
            .map_err(|_| ConversationError::SendErrorClosed)
    }
}

/// 已绑定监听地址的网关。
pub struct WsGateway {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WsGateway {
    /// 绑定监听地址（例如 "127.0.0.1:0"）。
    pub async fn bind(addr: &str) -> Result<Self, ConversationError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("[WS网关] 正在监听地址: {}", local_addr);
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受连接并为每个连接派生处理任务。只有监听器本身出错时才会返回。
    pub async fn serve(self, server: ConversationServer) -> Result<(), ConversationError> {
        loop {
            match self.listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("[WS网关] 从 {} 接受了新的 TCP 连接", peer_addr);
                    let server = server.clone();
                    tokio::spawn(async move {
                        handle_connection(server, tcp_stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("[WS网关] 接受 TCP 连接失败: {}。网关将继续运行。", e);
                }
            }
        }
    }
}

async fn handle_connection(server: ConversationServer, tcp_stream: TcpStream, peer_addr: SocketAddr) {
    let ws_stream = match accept_async(tcp_stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            error!("[WS网关] 与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
            return;
        }
    };
    info!("[WS网关] 与 {} 的 WebSocket 握手成功", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WireEnvelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outgoing_rx.recv().await {
            let frame = match envelope.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("[WS网关] 编码发往 {} 的信封失败: {}", peer_addr, e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(frame).await {
                warn!("[WS网关] 向 {} 写入失败，连接可能已断开: {}", peer_addr, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("[WS网关] 发往 {} 的写任务结束。", peer_addr);
    });

    let incoming = server.incoming_message_transport();
    let mut registration: Option<(String, Arc<dyn MessageTransport>)> = None;

    while let Some(received) = receive_envelope(&mut ws_receiver).await {
        let envelope = match received {
            Ok(envelope) => envelope,
            Err(ConversationError::DeserializationError(e)) => {
                warn!("[WS网关] 来自 {} 的帧无法解析，已忽略: {}", peer_addr, e);
                continue;
            }
            Err(e) => {
                warn!("[WS网关] 来自 {} 的连接出错，断开: {}", peer_addr, e);
                break;
            }
        };

        match envelope.message_type.as_str() {
            REGISTER_CLIENT_MESSAGE_TYPE => match envelope.deserialize_payload::<RegisterClientPayload>() {
                Ok(payload) => {
                    let transport: Arc<dyn MessageTransport> = Arc::new(WsResponseTransport {
                        outgoing: outgoing_tx.clone(),
                    });
                    server.add_client_response_transport(payload.client_id.clone(), Arc::clone(&transport));
                    info!("[WS网关] {} 注册为客户端 {}", peer_addr, payload.client_id);
                    registration = Some((payload.client_id, transport));
                }
                Err(e) => warn!("[WS网关] 无效的注册消息: {}", e),
            },
            START_CONVERSATION_MESSAGE_TYPE => {
                let request = match envelope.deserialize_payload::<StartConversationRequest>() {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("[WS网关] 无效的启动会话请求: {}", e);
                        continue;
                    }
                };
                let response = match &registration {
                    Some((client_id, _)) => {
                        match server.start_conversation(&request.service_type_id, client_id) {
                            Ok(conversation_id) => {
                                StartConversationResponse::success(&request.request_id, conversation_id)
                            }
                            Err(e) => StartConversationResponse::failure(&request.request_id, to_failure(e)),
                        }
                    }
                    None => StartConversationResponse::failure(
                        &request.request_id,
                        StartConversationFailure::UnknownClient(peer_addr.to_string()),
                    ),
                };
                match WireEnvelope::new(START_CONVERSATION_RESULT_MESSAGE_TYPE, &response) {
                    Ok(reply) => {
                        if outgoing_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("[WS网关] 编码启动会话结果失败: {}", e),
                }
            }
            CONVERSATION_MESSAGE_TYPE => match envelope.deserialize_payload::<ConversationMessage>() {
                Ok(message) => {
                    if let Err(e) = incoming.send(message) {
                        warn!("[WS网关] 转交入站消息失败: {}", e);
                    }
                }
                Err(e) => warn!("[WS网关] 无效的会话消息: {}", e),
            },
            other => warn!("[WS网关] 来自 {} 的未知消息类型 '{}'，已忽略。", peer_addr, other),
        }
    }

    info!("[WS网关] 与 {} 的连接已结束。", peer_addr);
    if let Some((client_id, transport)) = registration {
        server.remove_client_response_transport_if_same(&client_id, &transport);
    }
    drop(outgoing_tx);
    if let Err(e) = writer.await {
        error!("[WS网关] 写任务异常结束: {:?}", e);
    }
}

fn to_failure(error: ConversationError) -> StartConversationFailure {
    match error {
        ConversationError::UnknownServiceType(id) => StartConversationFailure::UnknownServiceType(id),
        ConversationError::UnknownClient(id) => StartConversationFailure::UnknownClient(id),
        other => StartConversationFailure::Other(other.to_string()),
    }
}

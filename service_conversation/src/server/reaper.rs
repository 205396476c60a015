// service_conversation/src/server/reaper.rs

//! 会话回收器模块。
//!
//! 定期检查所有会话的入站活跃时间。某个会话的客户端在其服务类型规定的
//! `client_timeout` 内没有任何消息时，回收器会：
//! 1. 向客户端发送一条以 `CLIENT_TIMEOUT_ERROR_NAME` 开头的异常消息；
//! 2. 以 `ClientTimeout` 中断该会话的服务任务（阻塞在 `receive` 的服务会收到错误而不是永远挂起）；
//! 3. 把会话从会话表中移除。

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::server::dispatcher::ConversationServer;

/// 回收器，运行在一个独立的后台任务中。
pub struct ConversationReaper {
    server: ConversationServer,
}

impl ConversationReaper {
    pub fn new(server: ConversationServer) -> Self {
        Self { server }
    }

    /// 主循环：每个周期醒来一次执行检查，收到关闭信号后退出。
    ///
    /// 周期每轮重新计算，新注册的短超时服务类型会立即生效。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[回收器] 后台运行循环已启动，当前检查周期: {:?}",
            self.server.effective_reaper_interval()
        );
        loop {
            let interval = self.server.effective_reaper_interval();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[回收器] 收到关闭信号，退出运行循环。");
                        break;
                    }
                }
                _ = sleep(interval) => {
                    self.check_for_timed_out_conversations();
                }
            }
        }
    }

    /// 对会话表快照做一轮超时检查，返回本轮回收的会话数。
    pub fn check_for_timed_out_conversations(&self) -> usize {
        let snapshot = self.server.conversations_snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut reaped = 0;
        for conversation in &snapshot {
            if conversation.is_idle_past_timeout(now_ms) {
                warn!(
                    "[回收器] 会话 {} (客户端 {}) 已超时！最后入站活动: {} ms 前，超时阈值: {:?}",
                    conversation.id(),
                    conversation.client_id(),
                    now_ms - conversation.last_activity_ms(),
                    conversation.client_timeout()
                );
                self.server.time_out_conversation(conversation);
                reaped += 1;
            }
        }
        debug!(
            "[回收器] 本轮检查了 {} 个会话，回收 {} 个。",
            snapshot.len(),
            reaped
        );
        reaped
    }
}

// service_conversation/src/server/service.rs

//! 服务类型注册与服务实现接口。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::server::messenger::ServiceMessenger;

/// 在一个会话内运行的服务实例。
///
/// `run` 在会话专属的任务上执行，通过 `ServiceMessenger` 收发消息。
/// 返回 `Ok(())` 表示正常结束；返回错误（或 panic）会让会话进入 `Failed`，
/// 错误描述作为异常消息发给客户端。`receive` 返回的 `Terminated`/`ClientTimeout`
/// 用 `?` 向上传播即可，分发器会把它们识别为正常关闭和超时。
pub trait ConversationService: Send + 'static {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// 服务类型工厂：每次启动会话时产出一个新的服务实例。
pub trait ServiceFactory: Send + Sync {
    fn service_type_id(&self) -> &str;

    fn create(&self) -> Box<dyn ConversationService>;

    /// 客户端无消息超过此时长，会话即被回收。
    fn client_timeout(&self) -> Duration;

    /// 客户端报告错误时是否立即中断服务任务并结束会话。
    /// 为 `false` 时错误按序排队，在服务下一次 `receive` 时抛出。
    fn interrupt_on_client_exception(&self) -> bool {
        false
    }
}

/// 基于闭包的服务类型定义。
///
/// ```no_run
/// use std::time::Duration;
/// use service_conversation::server::{ServiceDefinition, ServiceMessenger};
///
/// async fn echo(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
///     loop {
///         let text: String = messenger.receive().await?;
///         messenger.send(&text)?;
///     }
/// }
///
/// let definition = ServiceDefinition::new("echo", Duration::from_secs(30), echo);
/// ```
pub struct ServiceDefinition<F> {
    service_type_id: String,
    client_timeout: Duration,
    interrupt_on_client_exception: bool,
    handler: Arc<F>,
}

impl<F, Fut> ServiceDefinition<F>
where
    F: Fn(ServiceMessenger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(service_type_id: impl Into<String>, client_timeout: Duration, handler: F) -> Self {
        Self {
            service_type_id: service_type_id.into(),
            client_timeout,
            interrupt_on_client_exception: false,
            handler: Arc::new(handler),
        }
    }

    pub fn with_interrupt_on_client_exception(mut self, interrupt: bool) -> Self {
        self.interrupt_on_client_exception = interrupt;
        self
    }
}

struct FnService<F> {
    handler: Arc<F>,
}

impl<F, Fut> ConversationService for FnService<F>
where
    F: Fn(ServiceMessenger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin((self.handler)(messenger))
    }
}

impl<F, Fut> ServiceFactory for ServiceDefinition<F>
where
    F: Fn(ServiceMessenger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn service_type_id(&self) -> &str {
        &self.service_type_id
    }

    fn create(&self) -> Box<dyn ConversationService> {
        Box::new(FnService {
            handler: Arc::clone(&self.handler),
        })
    }

    fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    fn interrupt_on_client_exception(&self) -> bool {
        self.interrupt_on_client_exception
    }
}

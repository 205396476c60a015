use anyhow::Context;
use conversation_server::config;
use conversation_server::error::AppError;
use conversation_server::services::register_builtin_services;
use log::{error, info, LevelFilter};
use service_conversation::server::ws_gateway::WsGateway;
use service_conversation::ConversationServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG 未设置时默认 Info
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已初始化 (env_logger)。");

    let app_config = config::init_config();
    app_config.validate()?;
    info!(
        "[主程序] 应用配置已加载。监听地址: {}, 回收器周期上限: {} ms",
        app_config.server.bind_address(),
        app_config.server.reaper_interval_ms
    );

    let server = ConversationServer::new(app_config.server.to_server_config());
    register_builtin_services(&server, &app_config.services)?;
    server.start().map_err(AppError::from)?;

    let gateway = WsGateway::bind(&app_config.server.bind_address())
        .await
        .with_context(|| format!("无法绑定 {}", app_config.server.bind_address()))?;
    info!("[主程序] WebSocket 网关已就绪: ws://{}", gateway.local_addr());

    let serve_result = tokio::select! {
        result = gateway.serve(server.clone()) => result.map_err(|e| AppError::Gateway(e.to_string())),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("[主程序] 监听 Ctrl-C 信号失败: {}", e);
            }
            info!("[主程序] 收到退出信号，正在关闭...");
            Ok(())
        }
    };

    server.shutdown().await;
    info!("[主程序] 服务端已关闭。");
    serve_result?;
    Ok(())
}

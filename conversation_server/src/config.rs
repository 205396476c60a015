use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use service_conversation::ConversationServerConfig;

use crate::error::AppError;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "conversation_settings.json";
/// 默认监听地址
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8090;

/// 服务端进程配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// WebSocket 网关绑定的主机地址
    pub host: String,
    /// WebSocket 网关监听的端口号
    pub port: u16,
    /// 回收器检查周期的上限（毫秒）
    pub reaper_interval_ms: u64,
    /// 每个会话最多缓冲的超前消息数
    pub max_buffered_messages: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            reaper_interval_ms: 1000,
            max_buffered_messages: 64,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_server_config(&self) -> ConversationServerConfig {
        ConversationServerConfig {
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            max_buffered_messages: self.max_buffered_messages,
        }
    }
}

/// 内置服务类型的客户端超时（毫秒）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServicesSettings {
    pub echo_timeout_ms: u64,
    pub accumulator_timeout_ms: u64,
}

impl Default for ServicesSettings {
    fn default() -> Self {
        Self {
            echo_timeout_ms: 60_000,
            accumulator_timeout_ms: 300_000,
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub services: ServicesSettings,
}

impl AppConfig {
    /// 检查配置值是否可用。
    pub fn validate(&self) -> Result<(), AppError> {
        if self.server.host.trim().is_empty() {
            return Err(AppError::ConfigError("server.host 不能为空".to_string()));
        }
        if self.server.reaper_interval_ms == 0 {
            return Err(AppError::ConfigError("server.reaper_interval_ms 必须大于 0".to_string()));
        }
        if self.services.echo_timeout_ms == 0 || self.services.accumulator_timeout_ms == 0 {
            return Err(AppError::ConfigError("服务的客户端超时必须大于 0".to_string()));
        }
        Ok(())
    }
}

// 全局静态应用配置实例
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// 从指定路径加载配置；文件不存在或无法解析时使用默认配置并写回该路径。
pub fn load_config_from(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 从 {:?} 反序列化配置失败: {}。将使用默认配置并覆盖该文件。",
                    config_file_path, e
                );
                let default_config = AppConfig::default();
                save_config(&default_config, config_file_path);
                default_config
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件 (错误: {})。将使用默认配置并创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, config_file_path);
            default_config
        }
    }
}

/// 配置文件路径：`CONVERSATION_SETTINGS` 环境变量优先，否则为当前目录下的 `conversation_settings.json`。
fn get_config_file_path() -> PathBuf {
    if let Ok(path) = env::var("CONVERSATION_SETTINGS") {
        return PathBuf::from(path);
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }

    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已将当前配置保存到 {:?}。", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 序列化配置信息以便保存时失败: {}", e);
        }
    }
}

/// 初始化全局应用配置
pub fn init_config() -> &'static AppConfig {
    let loaded_config = load_config_from(&get_config_file_path());
    if APP_CONFIG.set(loaded_config).is_err() {
        warn!("[配置模块] 全局应用配置已被初始化，本次 init_config 调用未覆盖已有配置。");
    }
    get_config()
}

/// 获取全局应用配置；尚未初始化时按 `init_config` 的规则加载。
pub fn get_config() -> &'static AppConfig {
    APP_CONFIG.get_or_init(|| load_config_from(&get_config_file_path()))
}

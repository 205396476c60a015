//! `conversation_server` 服务端进程库。
//!
//! - `config`: 配置文件的加载、默认值与全局访问；
//! - `error`: 进程级错误类型；
//! - `services`: 内置服务类型（回显、累加）及其注册。

pub mod config;
pub mod error;
pub mod services;

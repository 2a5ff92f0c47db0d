//! Hive - 可暂停、可单步、可回滚的智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 无头运行时（从配置组装并跑一次 print 模式）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 执行控制器、权限闸门、重试策略、回滚日志、错误类型、信号与按键
//! - **engine**: AgentLoop 主循环、运行配置、结果与过程观察
//! - **llm**: 提供方抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 对话消息
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、参数校验、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

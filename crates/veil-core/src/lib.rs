//! # Veil Core
//!
//! 匿名化网关的核心模块，提供基础数据结构、错误定义、生命周期事件、
//! 配置加载和通用工具。

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod utils;

pub use config::VeilConfig;
pub use error::{Result, VeilError};
pub use events::{EventBus, LifecycleStatus, StudyEvent};
pub use models::*;

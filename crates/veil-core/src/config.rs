//! 配置管理
//!
//! 启动时从TOML文件加载一次，可被`VEIL_*`环境变量覆盖，不支持热更新。
//! 所有小节都有默认值，缺少配置文件时网关也能以默认参数启动。

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VeilError};

/// 网关完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// 接收端配置
    pub dicom: DicomConfig,
    /// Web服务配置
    pub web: WebConfig,
    /// 研究装配配置
    pub study: StudyConfig,
    /// 序列过滤配置
    pub series_filter: SeriesFilterConfig,
    /// 匿名化配置
    pub anonymization: AnonymizationConfig,
    /// 存储配置
    pub storage: StorageConfig,
    /// 远端上传配置
    pub remote: RemoteConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 接收端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DicomConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 本端AE标题
    pub ae_title: String,
}

impl Default for DicomConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11112,
            ae_title: "VEIL_GATEWAY".to_string(),
        }
    }
}

/// Web服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 研究装配配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// 静默多少秒后判定研究完成
    pub completion_timeout_secs: u64,
    /// 完成监视器扫描间隔
    pub sweep_interval_secs: u64,
    /// 同时定稿的研究数量上限
    pub max_parallel_finalize: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            completion_timeout_secs: 300,
            sweep_interval_secs: 5,
            max_parallel_finalize: 4,
        }
    }
}

/// 序列过滤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesFilterConfig {
    /// 排除的模态列表
    pub exclude_modalities: Vec<String>,
    /// 同一采集只保留原始序列
    pub keep_original_series: bool,
}

impl Default for SeriesFilterConfig {
    fn default() -> Self {
        Self {
            exclude_modalities: Vec::new(),
            keep_original_series: true,
        }
    }
}

/// 匿名化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizationConfig {
    /// 匿名化规则集名称（compliance / research）
    pub profile: String,
    /// 生成新UID时使用的UID根
    pub uid_root: String,
}

impl Default for AnonymizationConfig {
    fn default() -> Self {
        Self {
            profile: "compliance".to_string(),
            uid_root: "2.25".to_string(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 归档根目录
    pub base_path: String,
    /// 归档提交的重试次数上限
    pub commit_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./data/archives".to_string(),
            commit_retries: 3,
        }
    }
}

/// 远端上传配置，未设置base_url时上传被禁用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl VeilConfig {
    /// 从配置文件与环境变量加载
    ///
    /// 环境变量使用`VEIL_`前缀与双下划线分隔，
    /// 例如`VEIL_STUDY__COMPLETION_TIMEOUT_SECS=60`。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("config/veil").required(false));
        }

        builder = builder.add_source(Environment::with_prefix("VEIL").separator("__"));

        let config = builder
            .build()
            .map_err(|e| VeilError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| VeilError::Config(e.to_string()))
    }
}

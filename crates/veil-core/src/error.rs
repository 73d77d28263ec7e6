//! 错误定义模块

use thiserror::Error;

/// 网关统一错误类型
#[derive(Error, Debug)]
pub enum VeilError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("匿名化错误: {0}")]
    Anonymization(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("归档提交失败: {0}")]
    Commit(String),

    #[error("上传错误: {0}")]
    Upload(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 到 {to}")]
    InvalidStateTransition { from: String, to: String },
}

/// 网关统一结果类型
pub type Result<T> = std::result::Result<T, VeilError>;

//! # Veil DICOM
//!
//! DICOM数据集的解析、规范化校验以及简化的接收服务。
//! 解析产出`veil-core`定义的标签视图，核心管线不接触底层编码。

pub mod parser;
pub mod receiver;
pub mod validator;

pub use parser::{DicomParser, ParsedInstance};
pub use receiver::{IngestSink, StoreServer};
pub use validator::DatasetValidator;

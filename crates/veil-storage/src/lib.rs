//! # Veil Storage
//!
//! 归档制品的持久化：本地Blob存储（暂存 + 原子重命名提交）、
//! 研究归档打包（tar + gzip），以及可选的远端上传。

pub mod archive;
pub mod blob;
pub mod remote;

pub use archive::{ArchiveEntry, ArchiveManifest, ManifestSeries, StudyArchiver};
pub use blob::{BlobStore, StagedBlob};
pub use remote::RemoteUploader;

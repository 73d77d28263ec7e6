//! 研究归档打包
//!
//! 把一个研究的全部匿名化实例打成单个 tar + gzip 制品，
//! 制品内是 `manifest.json` 加上 `序列UID/实例UID.json` 条目，
//! 以匿名化后的StudyInstanceUID作为存储键，经Blob存储原子提交。

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::blob::BlobStore;
use veil_core::{Result, VeilError};

/// 归档内的单个条目
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// 归档内路径，如 `<series-uid>/<sop-uid>.json`
    pub path: String,
    pub bytes: Vec<u8>,
}

/// 归档清单中的序列摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSeries {
    pub series_uid: String,
    pub modality: String,
    pub instance_count: usize,
}

/// 归档清单，写入制品根部的 `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub archive_key: String,
    pub created_at: DateTime<Utc>,
    pub instance_count: usize,
    pub series: Vec<ManifestSeries>,
}

/// 研究归档器
#[derive(Debug, Clone)]
pub struct StudyArchiver {
    store: Arc<BlobStore>,
}

impl StudyArchiver {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    /// 打包并提交一个研究，返回制品的存储键与最终路径
    pub async fn archive_study(
        &self,
        manifest: &ArchiveManifest,
        entries: &[ArchiveEntry],
    ) -> Result<(String, PathBuf)> {
        let bytes = build_archive(manifest, entries)?;
        let key = format!("{}.tar.gz", manifest.archive_key);

        let staged = self.store.put_staged(&key, &bytes).await?;
        let path = self.store.commit(staged).await?;

        info!(
            "研究归档完成: {} ({} 实例, {} bytes)",
            key,
            manifest.instance_count,
            bytes.len()
        );
        Ok((key, path))
    }
}

/// 在内存中构建 tar.gz 制品
pub fn build_archive(manifest: &ArchiveManifest, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let manifest_json = serde_json::to_vec_pretty(manifest)?;
    append_entry(&mut builder, "manifest.json", &manifest_json)?;

    for entry in entries {
        append_entry(&mut builder, &entry.path, &entry.bytes)?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| VeilError::Storage(format!("tar构建失败: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| VeilError::Storage(format!("gzip压缩失败: {}", e)))
}

fn append_entry(
    builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
    path: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp() as u64);
    builder
        .append_data(&mut header, path, bytes)
        .map_err(|e| VeilError::Storage(format!("写入归档条目 {} 失败: {}", path, e)))?;
    Ok(())
}

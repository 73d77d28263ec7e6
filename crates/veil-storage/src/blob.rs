//! Blob存储
//!
//! 键 → 字节的本地存储，提交语义为"先写暂存文件，再原子重命名"。
//! 同一文件系统内的rename保证制品要么完整可见，要么不可见。

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use veil_core::{Result, VeilError};

/// 暂存目录名，位于存储根目录下
const STAGING_DIR: &str = ".staging";

/// 已写入暂存区、等待提交的Blob
#[derive(Debug)]
pub struct StagedBlob {
    key: String,
    staging_path: PathBuf,
    final_path: PathBuf,
}

impl StagedBlob {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// 本地Blob存储
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// 打开存储目录，必要时创建根目录与暂存目录
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;
        info!("Blob存储就绪: {:?}", root);
        Ok(Self { root })
    }

    /// 将字节写入暂存区，返回待提交句柄
    pub async fn put_staged(&self, key: &str, bytes: &[u8]) -> Result<StagedBlob> {
        let key = sanitize_key(key)?;
        let staging_path = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}.{}.tmp", key, Uuid::new_v4().simple()));
        let final_path = self.root.join(&key);

        tokio::fs::write(&staging_path, bytes).await?;
        debug!("已写入暂存: {:?} ({} bytes)", staging_path, bytes.len());

        Ok(StagedBlob {
            key,
            staging_path,
            final_path,
        })
    }

    /// 原子提交：重命名暂存文件到最终位置
    pub async fn commit(&self, staged: StagedBlob) -> Result<PathBuf> {
        tokio::fs::rename(&staged.staging_path, &staged.final_path)
            .await
            .map_err(|e| VeilError::Commit(format!("{}: {}", staged.key, e)))?;
        info!("已提交Blob: {}", staged.key);
        Ok(staged.final_path)
    }

    /// 读取已提交的Blob
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = sanitize_key(key)?;
        let path = self.root.join(&key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VeilError::NotFound(key))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 已提交Blob的路径（不检查存在性）
    pub fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_key(key)?))
    }

    pub async fn exists(&self, key: &str) -> bool {
        match sanitize_key(key) {
            Ok(key) => tokio::fs::try_exists(self.root.join(key))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// 键只允许字母数字与 `. _ -`，拒绝路径穿越
fn sanitize_key(key: &str) -> Result<String> {
    if key.is_empty()
        || key.starts_with('.')
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(VeilError::Storage(format!("非法的存储键: {:?}", key)));
    }
    Ok(key.to_string())
}

//! 远端上传
//!
//! 归档成功后把制品交给远端存储服务，带有界重试；
//! 上传在定稿路径之外异步执行，失败只影响远端副本，不影响本地归档。

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use veil_core::config::RemoteConfig;
use veil_core::{Result, VeilError};

/// 远端上传器
#[derive(Debug, Clone)]
pub struct RemoteUploader {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RemoteUploader {
    /// 根据配置构建，未配置base_url时返回None（上传禁用）
    pub fn from_config(config: &RemoteConfig) -> Option<Self> {
        let base_url = config.base_url.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        })
    }

    /// 上传一个归档制品，返回提交ID
    pub async fn submit(&self, archive_key: &str, path: &Path) -> Result<String> {
        // Bytes按引用计数克隆，重试不复制制品内容
        let bytes = Bytes::from(tokio::fs::read(path).await?);
        let url = format!("{}/upload/{}", self.base_url, archive_key);

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/gzip")
                .body(bytes.clone());
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let submission_id = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| {
                            v.get("submission_id")
                                .and_then(|id| id.as_str())
                                .map(|id| id.to_string())
                        })
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    info!("归档上传成功: {} -> {}", archive_key, submission_id);
                    return Ok(submission_id);
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(
                "上传 {} 第{}次失败: {}",
                archive_key, attempt, last_error
            );
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(VeilError::Upload(format!(
            "{} 重试{}次后仍失败: {}",
            archive_key, self.max_retries, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::config::RemoteConfig;

    #[test]
    fn test_disabled_without_base_url() {
        assert!(RemoteUploader::from_config(&RemoteConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_submit_fails_after_bounded_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2.25.1.tar.gz");
        tokio::fs::write(&path, b"archive").await.unwrap();

        // 指向无服务的本地端口，两次尝试后报上传错误
        let uploader = RemoteUploader::from_config(&RemoteConfig {
            base_url: Some("http://127.0.0.1:9".to_string()),
            auth_token: None,
            max_retries: 2,
            retry_delay_secs: 0,
        })
        .unwrap();

        let err = uploader.submit("2.25.1.tar.gz", &path).await.unwrap_err();
        assert!(matches!(err, VeilError::Upload(_)));
    }
}

//! 研究完成监视器
//!
//! 周期性扫描登记表，把静默超时的活动研究迁移到 finalizing 并派发定稿任务。
//! `mark_finalizing`是幂等安全的，相邻两次扫描同时捞到同一研究也只定稿一次；
//! 到期判定在研究锁内复核，收集与标记之间到达的实例会把定稿推迟到下一轮。
//! 定稿任务经信号量限流，扫描循环本身永不阻塞在定稿上。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::registry::{MarkOutcome, StudyRegistry};
use veil_core::config::StudyConfig;

/// 定稿执行方，由管线引擎实现
#[async_trait]
pub trait StudyFinalizer: Send + Sync {
    async fn finalize_study(&self, study_uid: &str);
}

/// 完成监视器
pub struct CompletionMonitor {
    registry: Arc<StudyRegistry>,
    finalizer: Arc<dyn StudyFinalizer>,
    completion_timeout: Duration,
    sweep_interval: std::time::Duration,
    semaphore: Arc<Semaphore>,
}

impl CompletionMonitor {
    pub fn new(
        registry: Arc<StudyRegistry>,
        finalizer: Arc<dyn StudyFinalizer>,
        config: &StudyConfig,
    ) -> Self {
        Self {
            registry,
            finalizer,
            completion_timeout: Duration::seconds(config.completion_timeout_secs as i64),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
            semaphore: Arc::new(Semaphore::new(config.max_parallel_finalize.max(1))),
        }
    }

    /// 监视循环
    pub async fn run(self: Arc<Self>) {
        info!(
            timeout_secs = self.completion_timeout.num_seconds(),
            interval_secs = self.sweep_interval.as_secs(),
            "完成监视器启动"
        );
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            interval.tick().await;
            self.sweep(Utc::now()).await;
        }
    }

    /// 单次扫描，`now`由调用方注入，返回本次派发定稿的研究
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let due = self
            .registry
            .due_for_completion(now, self.completion_timeout)
            .await;
        let mut started = Vec::new();

        for study_uid in due {
            match self
                .registry
                .mark_finalizing(&study_uid, now, self.completion_timeout)
                .await
            {
                MarkOutcome::Marked => {
                    info!(study_uid = %study_uid, "研究静默超时，进入定稿");
                    self.spawn_finalize(study_uid.clone());
                    started.push(study_uid);
                }
                MarkOutcome::NotDue => {
                    debug!(study_uid = %study_uid, "截止前又有实例到达，推迟定稿");
                }
                MarkOutcome::AlreadyFinalizing => {
                    debug!(study_uid = %study_uid, "研究已在定稿中，跳过");
                }
                MarkOutcome::NotFound => {
                    debug!(study_uid = %study_uid, "研究已不在登记表中，跳过");
                }
            }
        }
        started
    }

    fn spawn_finalize(&self, study_uid: String) {
        let semaphore = Arc::clone(&self.semaphore);
        let finalizer = Arc::clone(&self.finalizer);
        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("获取定稿许可失败: {}", e);
                    return;
                }
            };
            finalizer.finalize_study(&study_uid).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SeriesFilter;
    use std::time::Duration as StdDuration;
    use tokio::sync::Mutex;
    use veil_core::config::SeriesFilterConfig;
    use veil_core::models::tags;
    use veil_core::DicomDataset;

    struct RecordingFinalizer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StudyFinalizer for RecordingFinalizer {
        async fn finalize_study(&self, study_uid: &str) {
            self.calls.lock().await.push(study_uid.to_string());
        }
    }

    fn monitor_under_test() -> (Arc<StudyRegistry>, Arc<RecordingFinalizer>, CompletionMonitor)
    {
        let registry = Arc::new(StudyRegistry::new(SeriesFilter::new(
            &SeriesFilterConfig::default(),
        )));
        let finalizer = Arc::new(RecordingFinalizer {
            calls: Mutex::new(Vec::new()),
        });
        let config = StudyConfig {
            completion_timeout_secs: 300,
            sweep_interval_secs: 1,
            max_parallel_finalize: 2,
        };
        let monitor = CompletionMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&finalizer) as Arc<dyn StudyFinalizer>,
            &config,
        );
        (registry, finalizer, monitor)
    }

    fn instance(study: &str, sop: &str) -> DicomDataset {
        [
            (tags::STUDY_INSTANCE_UID.to_string(), study.to_string()),
            (tags::SERIES_INSTANCE_UID.to_string(), format!("{}.1", study)),
            (tags::SOP_INSTANCE_UID.to_string(), sop.to_string()),
            (tags::MODALITY.to_string(), "CT".to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_sweep_never_finalizes_early() {
        let (registry, _finalizer, monitor) = monitor_under_test();
        registry.upsert(&instance("1.2", "1.2.1.1")).await;

        // 未到超时，任何扫描都不派发
        assert!(monitor.sweep(Utc::now()).await.is_empty());
        assert!(monitor
            .sweep(Utc::now() + Duration::seconds(299))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_dispatches_once_after_timeout() {
        let (registry, finalizer, monitor) = monitor_under_test();
        registry.upsert(&instance("1.2", "1.2.1.1")).await;

        let later = Utc::now() + Duration::seconds(301);
        assert_eq!(monitor.sweep(later).await, vec!["1.2".to_string()]);
        // 第二次扫描捞到同一研究但已在定稿中
        assert!(monitor.sweep(later).await.is_empty());

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(*finalizer.calls.lock().await, vec!["1.2".to_string()]);
    }

    #[tokio::test]
    async fn test_stray_instance_still_finalizes() {
        let (registry, _finalizer, monitor) = monitor_under_test();
        // 只有一个实例的研究同样按超时定稿，不存在完整性先验
        registry.upsert(&instance("9.9", "9.9.1.1")).await;
        let later = Utc::now() + Duration::seconds(400);
        assert_eq!(monitor.sweep(later).await, vec!["9.9".to_string()]);
    }
}

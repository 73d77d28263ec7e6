//! 管线引擎
//!
//! 把各环节装配成完整管线：作为`IngestSink`接收传输层交来的实例并写入登记表，
//! 作为`StudyFinalizer`执行定稿（匿名化 → 打包 → 原子提交 → 可选远端上传）。
//!
//! 提交失败在有界次数内重试，每次重试从匿名化一步重新执行；
//! 重映射表与新身份在首次尝试时固定，重试产出与上次完全一致。

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::anonymizer::{anonymize, AnonymizationProfile, FreshIdentifiers, UidRemap};
use crate::monitor::StudyFinalizer;
use crate::registry::{StudyExport, StudyRegistry, UpsertOutcome};
use veil_core::config::VeilConfig;
use veil_core::events::{EventBus, LifecycleStatus, StudyEvent};
use veil_core::models::tags;
use veil_core::{AcceptResult, DicomDataset, Result, SessionMeta, VeilError};
use veil_dicom::IngestSink;
use veil_storage::{ArchiveEntry, ArchiveManifest, ManifestSeries, RemoteUploader, StudyArchiver};

/// 管线引擎
pub struct PipelineEngine {
    registry: Arc<StudyRegistry>,
    archiver: StudyArchiver,
    uploader: Option<Arc<RemoteUploader>>,
    events: Arc<EventBus>,
    profile: AnonymizationProfile,
    uid_root: String,
    commit_retries: u32,
}

/// 一次成功定稿的产出
struct FinalizeOutcome {
    archive_key: String,
    archive_path: PathBuf,
    series_count: usize,
    instance_count: usize,
}

/// 匿名化与打包的中间产物
struct Packaged {
    manifest: ArchiveManifest,
    entries: Vec<ArchiveEntry>,
    instance_count: usize,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<StudyRegistry>,
        archiver: StudyArchiver,
        uploader: Option<Arc<RemoteUploader>>,
        events: Arc<EventBus>,
        config: &VeilConfig,
    ) -> Self {
        Self {
            registry,
            archiver,
            uploader,
            events,
            profile: AnonymizationProfile::by_name(&config.anonymization.profile),
            uid_root: config.anonymization.uid_root.clone(),
            commit_retries: config.storage.commit_retries,
        }
    }

    pub fn registry(&self) -> &Arc<StudyRegistry> {
        &self.registry
    }

    /// 定稿一个已标记finalizing的研究
    pub async fn finalize(&self, study_uid: &str) {
        let Some(export) = self.registry.export(study_uid).await else {
            warn!(study_uid = %study_uid, "定稿时研究已不在登记表中");
            return;
        };
        self.events
            .emit(StudyEvent::new(
                study_uid,
                LifecycleStatus::Finalizing,
                export.series.len(),
                export.instance_count(),
            ))
            .await;

        match self.run_finalize(&export).await {
            Ok(outcome) => {
                info!(
                    study_uid = %study_uid,
                    archive_key = %outcome.archive_key,
                    series = outcome.series_count,
                    instances = outcome.instance_count,
                    "研究定稿完成"
                );
                // 终态事件先于移除发布，订阅者看到completed时记录仍可查询
                self.events
                    .emit(StudyEvent::new(
                        study_uid,
                        LifecycleStatus::Completed,
                        outcome.series_count,
                        outcome.instance_count,
                    ))
                    .await;
                self.registry.remove(study_uid).await;
                self.spawn_upload(outcome);
            }
            Err(e) => {
                error!(study_uid = %study_uid, "研究定稿失败: {}", e);
                self.registry.mark_failed(study_uid).await;
                self.events
                    .emit(StudyEvent::new(
                        study_uid,
                        LifecycleStatus::Failed,
                        export.series.len(),
                        export.instance_count(),
                    ))
                    .await;
            }
        }
    }

    async fn run_finalize(&self, export: &StudyExport) -> Result<FinalizeOutcome> {
        // 新身份与重映射表在首次尝试时固定，重试产出可确定重放
        let fresh = FreshIdentifiers::generate();
        let mut remap = UidRemap::new(&self.uid_root);

        let attempts = self.commit_retries.max(1);
        let mut last_error = VeilError::Commit("归档提交未执行".to_string());
        for attempt in 1..=attempts {
            let packaged = self.package(export, &mut remap, &fresh)?;
            match self
                .archiver
                .archive_study(&packaged.manifest, &packaged.entries)
                .await
            {
                Ok((archive_key, archive_path)) => {
                    return Ok(FinalizeOutcome {
                        archive_key,
                        archive_path,
                        series_count: packaged.manifest.series.len(),
                        instance_count: packaged.instance_count,
                    })
                }
                Err(e) => {
                    warn!(
                        study_uid = %export.study_uid,
                        attempt,
                        attempts,
                        "归档提交失败: {}",
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// 匿名化全部实例并组织归档条目
    ///
    /// 单个实例匿名化失败只跳过该实例；全部失败时研究定稿失败。
    fn package(
        &self,
        export: &StudyExport,
        remap: &mut UidRemap,
        fresh: &FreshIdentifiers,
    ) -> Result<Packaged> {
        let mut entries = Vec::new();
        let mut manifest_series = Vec::new();
        let mut survivors = 0usize;

        for series in &export.series {
            let mut series_uid = None;
            let mut series_survivors = 0usize;

            for dataset in &series.datasets {
                let anonymized = match anonymize(&self.profile, dataset, remap, fresh) {
                    Ok(anonymized) => anonymized,
                    Err(e) => {
                        warn!(
                            study_uid = %export.study_uid,
                            series_uid = %series.series_uid,
                            "实例匿名化失败，跳过: {}",
                            e
                        );
                        continue;
                    }
                };
                let (Some(anon_series), Some(anon_sop)) = (
                    anonymized.get(tags::SERIES_INSTANCE_UID),
                    anonymized.get(tags::SOP_INSTANCE_UID),
                ) else {
                    warn!(
                        study_uid = %export.study_uid,
                        series_uid = %series.series_uid,
                        "匿名化输出缺少序列/实例UID，跳过"
                    );
                    continue;
                };

                let path = format!("{}/{}.json", anon_series, anon_sop);
                series_uid = Some(anon_series.to_string());
                entries.push(ArchiveEntry {
                    path,
                    bytes: serde_json::to_vec_pretty(&anonymized)?,
                });
                series_survivors += 1;
                survivors += 1;
            }

            if let Some(series_uid) = series_uid {
                manifest_series.push(ManifestSeries {
                    series_uid,
                    modality: series.modality.clone(),
                    instance_count: series_survivors,
                });
            }
        }

        if survivors == 0 {
            return Err(VeilError::Anonymization(format!(
                "研究 {} 没有实例通过匿名化",
                export.study_uid
            )));
        }

        let archive_key = remap.map(&export.study_uid)?;
        Ok(Packaged {
            manifest: ArchiveManifest {
                archive_key,
                created_at: Utc::now(),
                instance_count: survivors,
                series: manifest_series,
            },
            entries,
            instance_count: survivors,
        })
    }

    /// 远端提交不阻塞定稿，失败只影响远端副本
    fn spawn_upload(&self, outcome: FinalizeOutcome) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        let uploader = Arc::clone(uploader);
        tokio::spawn(async move {
            match uploader
                .submit(&outcome.archive_key, &outcome.archive_path)
                .await
            {
                Ok(submission_id) => {
                    info!(
                        archive_key = %outcome.archive_key,
                        submission_id = %submission_id,
                        "远端提交完成"
                    );
                }
                Err(e) => {
                    error!(archive_key = %outcome.archive_key, "远端提交失败: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl IngestSink for PipelineEngine {
    async fn on_instance_received(
        &self,
        session: SessionMeta,
        dataset: DicomDataset,
    ) -> AcceptResult {
        let outcome = self.registry.upsert(&dataset).await;
        match &outcome {
            UpsertOutcome::Created { study_uid, .. } => {
                debug!(
                    calling_ae = %session.calling_ae_title,
                    study_uid = %study_uid,
                    "首个实例到达，研究已创建"
                );
                self.emit_snapshot(study_uid, LifecycleStatus::Created).await;
            }
            UpsertOutcome::Updated { study_uid, .. } => {
                self.emit_snapshot(study_uid, LifecycleStatus::Updated).await;
            }
            UpsertOutcome::Rejected(reason) => {
                debug!(
                    calling_ae = %session.calling_ae_title,
                    "实例被拒绝: {}",
                    reason.code()
                );
            }
        }
        outcome.to_accept_result()
    }
}

impl PipelineEngine {
    async fn emit_snapshot(&self, study_uid: &str, status: LifecycleStatus) {
        if let Some(summary) = self.registry.get(study_uid).await {
            self.events
                .emit(StudyEvent::new(
                    study_uid,
                    status,
                    summary.series_count,
                    summary.instance_count,
                ))
                .await;
        }
    }
}

#[async_trait]
impl StudyFinalizer for PipelineEngine {
    async fn finalize_study(&self, study_uid: &str) {
        self.finalize(study_uid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SeriesFilter;
    use crate::monitor::CompletionMonitor;
    use crate::registry::MarkOutcome;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use veil_core::StudyStatus;
    use veil_storage::BlobStore;

    async fn engine_under_test(dir: &std::path::Path) -> (Arc<PipelineEngine>, Arc<EventBus>) {
        let config = VeilConfig::default();
        let registry = Arc::new(StudyRegistry::new(SeriesFilter::new(&config.series_filter)));
        let store = Arc::new(BlobStore::open(dir).await.unwrap());
        let events = Arc::new(EventBus::default());
        let engine = Arc::new(PipelineEngine::new(
            registry,
            StudyArchiver::new(store),
            None,
            Arc::clone(&events),
            &config,
        ));
        (engine, events)
    }

    fn session() -> SessionMeta {
        SessionMeta {
            calling_ae_title: "CT_SCANNER_01".to_string(),
            called_ae_title: "VEIL_GATEWAY".to_string(),
            transfer_syntax_uid: None,
            remote_addr: None,
        }
    }

    fn instance(study: &str, series: &str, sop: &str, extra: &[(&str, &str)]) -> DicomDataset {
        let mut dataset = DicomDataset::new();
        dataset.set(tags::STUDY_INSTANCE_UID, study);
        dataset.set(tags::SERIES_INSTANCE_UID, series);
        dataset.set(tags::SOP_INSTANCE_UID, sop);
        dataset.set(tags::MODALITY, "CT");
        dataset.set(tags::PATIENT_NAME, "DOE^JANE");
        dataset.set(tags::PATIENT_ID, "HOSP-001234");
        for (k, v) in extra {
            dataset.set(*k, *v);
        }
        dataset
    }

    async fn force_finalizing(engine: &PipelineEngine, study_uid: &str) -> MarkOutcome {
        let later = Utc::now() + chrono::Duration::seconds(301);
        engine
            .registry()
            .mark_finalizing(study_uid, later, chrono::Duration::seconds(300))
            .await
    }

    fn read_archive(dir: &std::path::Path) -> (ArchiveManifest, Vec<(String, DicomDataset)>) {
        let archive_path = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().map(|ext| ext == "gz").unwrap_or(false))
            .expect("目录下应有归档制品");
        let bytes = std::fs::read(archive_path).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
        let mut manifest = None;
        let mut datasets = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut json = String::new();
            entry.read_to_string(&mut json).unwrap();
            if path == "manifest.json" {
                manifest = Some(serde_json::from_str(&json).unwrap());
            } else {
                datasets.push((path, serde_json::from_str(&json).unwrap()));
            }
        }
        (manifest.expect("归档内应有清单"), datasets)
    }

    #[tokio::test]
    async fn test_full_study_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, events) = engine_under_test(dir.path()).await;
        let frame = (tags::FRAME_OF_REFERENCE_UID, "5.5.5");

        // 原始序列两个实例 + 同采集的衍生序列一个实例
        let results = [
            engine
                .on_instance_received(
                    session(),
                    instance(
                        "1.2",
                        "1.2.1",
                        "1.2.1.1",
                        &[(tags::IMAGE_TYPE, r"ORIGINAL\PRIMARY"), frame],
                    ),
                )
                .await,
            engine
                .on_instance_received(
                    session(),
                    instance(
                        "1.2",
                        "1.2.1",
                        "1.2.1.2",
                        &[(tags::IMAGE_TYPE, r"ORIGINAL\PRIMARY"), frame],
                    ),
                )
                .await,
            engine
                .on_instance_received(
                    session(),
                    instance(
                        "1.2",
                        "1.2.2",
                        "1.2.2.1",
                        &[(tags::IMAGE_TYPE, r"DERIVED\SECONDARY"), frame],
                    ),
                )
                .await,
        ];
        assert!(results[0].is_accepted());
        assert!(results[1].is_accepted());
        assert!(!results[2].is_accepted());

        assert_eq!(force_finalizing(&engine, "1.2").await, MarkOutcome::Marked);
        engine.finalize("1.2").await;

        // 归档成功后研究离开登记表
        assert!(engine.registry().get("1.2").await.is_none());

        let (manifest, datasets) = read_archive(dir.path());
        assert_eq!(manifest.instance_count, 2);
        assert_eq!(manifest.series.len(), 1);
        assert!(manifest.archive_key.starts_with("2.25."));

        for (path, dataset) in &datasets {
            // 条目路径使用匿名化后的UID
            assert!(!path.contains("1.2.1"));
            assert_ne!(dataset.get(tags::PATIENT_NAME), Some("DOE^JANE"));
            assert_ne!(dataset.get(tags::PATIENT_ID), Some("HOSP-001234"));
            assert_eq!(
                dataset.get(tags::STUDY_INSTANCE_UID),
                Some(manifest.archive_key.as_str())
            );
        }
        // 同研究实例的新身份一致
        assert_eq!(
            datasets[0].1.get(tags::PATIENT_ID),
            datasets[1].1.get(tags::PATIENT_ID)
        );

        let statuses: Vec<_> = events.recent().await.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&LifecycleStatus::Created));
        assert!(statuses.contains(&LifecycleStatus::Finalizing));
        assert_eq!(statuses.last(), Some(&LifecycleStatus::Completed));
    }

    #[tokio::test]
    async fn test_partial_anonymization_failure_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, events) = engine_under_test(dir.path()).await;

        engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "1.2.1.1", &[]))
            .await;
        // 空SOP UID的实例无法重映射，定稿时被跳过
        engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "", &[]))
            .await;

        force_finalizing(&engine, "1.2").await;
        engine.finalize("1.2").await;

        let (manifest, _) = read_archive(dir.path());
        assert_eq!(manifest.instance_count, 1);

        let completed = events
            .recent()
            .await
            .into_iter()
            .find(|e| e.status == LifecycleStatus::Completed)
            .expect("应有completed事件");
        assert_eq!(completed.instance_count, 1);
    }

    #[tokio::test]
    async fn test_zero_survivors_marks_study_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, events) = engine_under_test(dir.path()).await;

        engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "", &[]))
            .await;
        force_finalizing(&engine, "1.2").await;
        engine.finalize("1.2").await;

        // 失败研究停留在登记表中供排查
        let summary = engine.registry().get("1.2").await.unwrap();
        assert_eq!(summary.status, StudyStatus::Failed);

        let statuses: Vec<_> = events.recent().await.iter().map(|e| e.status).collect();
        assert_eq!(statuses.last(), Some(&LifecycleStatus::Failed));
    }

    #[tokio::test]
    async fn test_timeout_driven_completion_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, events) = engine_under_test(dir.path()).await;
        engine
            .on_instance_received(session(), instance("7.7", "7.7.1", "7.7.1.1", &[]))
            .await;

        let config = VeilConfig::default();
        let monitor = CompletionMonitor::new(
            Arc::clone(engine.registry()),
            Arc::clone(&engine) as Arc<dyn StudyFinalizer>,
            &config.study,
        );

        // 超时前不动
        assert!(monitor.sweep(Utc::now()).await.is_empty());
        // 超时后派发一次
        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(monitor.sweep(later).await, vec!["7.7".to_string()]);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(engine.registry().get("7.7").await.is_none());
        let statuses: Vec<_> = events.recent().await.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&LifecycleStatus::Completed));
    }

    #[tokio::test]
    async fn test_completed_event_published_before_removal() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, events) = engine_under_test(dir.path()).await;

        engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "1.2.1.1", &[]))
            .await;
        force_finalizing(&engine, "1.2").await;

        let mut rx = events.subscribe();
        engine.finalize("1.2").await;

        // 订阅者先收到finalizing，再收到completed，随后研究才不可查
        let first = rx.try_recv().unwrap();
        assert_eq!(first.status, LifecycleStatus::Finalizing);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.status, LifecycleStatus::Completed);
        assert_eq!(second.instance_count, 1);
        assert!(engine.registry().get("1.2").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected_through_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _events) = engine_under_test(dir.path()).await;

        let first = engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "1.2.1.1", &[]))
            .await;
        let second = engine
            .on_instance_received(session(), instance("1.2", "1.2.1", "1.2.1.1", &[]))
            .await;
        assert!(first.is_accepted());
        assert!(!second.is_accepted());
    }
}

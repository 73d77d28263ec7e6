//! 研究登记表
//!
//! 在内存中按StudyInstanceUID聚合到达的实例。外层`RwLock<HashMap>`只做
//! 短暂的查找与插入，每个研究持有自己的`Mutex<StudyRecord>`，
//! 同一研究的所有变更被串行化，不同研究互不阻塞。
//!
//! 研究只有两条离开登记表的路径：归档成功后被移除，
//! 或不可恢复失败后停留在 failed 状态供排查。

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::filter::{AcquisitionKey, SeriesFilter, SeriesResolution};
use veil_core::models::tags;
use veil_core::{AcceptResult, DicomDataset, RejectReason, StudyStatus, StudySummary};

/// 一次接收的实例
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub sop_instance_uid: String,
    pub dataset: DicomDataset,
    pub received_at: DateTime<Utc>,
}

/// 研究内的一个序列
#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub series_uid: String,
    pub modality: String,
    pub original: bool,
    pub acquisition_key: Option<AcquisitionKey>,
    /// SOPInstanceUID → 实例，BTreeMap保证导出顺序稳定
    pub instances: BTreeMap<String, InstanceRecord>,
}

/// 研究记录
#[derive(Debug)]
pub struct StudyRecord {
    pub study_uid: String,
    pub status: StudyStatus,
    pub series: HashMap<String, SeriesRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl StudyRecord {
    fn new(study_uid: &str) -> Self {
        let now = Utc::now();
        Self {
            study_uid: study_uid.to_string(),
            status: StudyStatus::Active,
            series: HashMap::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    fn instance_count(&self) -> usize {
        self.series.values().map(|s| s.instances.len()).sum()
    }

    fn summary(&self) -> StudySummary {
        let mut modalities: Vec<String> = self
            .series
            .values()
            .map(|s| s.modality.clone())
            .collect();
        modalities.sort();
        modalities.dedup();
        StudySummary {
            study_uid: self.study_uid.clone(),
            status: self.status,
            series_count: self.series.len(),
            instance_count: self.instance_count(),
            modalities,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// 实例写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created {
        study_uid: String,
        series_uid: String,
        sop_instance_uid: String,
    },
    Updated {
        study_uid: String,
        series_uid: String,
        sop_instance_uid: String,
    },
    Rejected(RejectReason),
}

impl UpsertOutcome {
    pub fn to_accept_result(&self) -> AcceptResult {
        match self {
            Self::Created {
                study_uid,
                series_uid,
                sop_instance_uid,
            }
            | Self::Updated {
                study_uid,
                series_uid,
                sop_instance_uid,
            } => AcceptResult::Accepted {
                study_uid: study_uid.clone(),
                series_uid: series_uid.clone(),
                sop_instance_uid: sop_instance_uid.clone(),
            },
            Self::Rejected(reason) => AcceptResult::Rejected {
                reason: reason.clone(),
            },
        }
    }
}

/// 状态标记结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    /// 研究锁内复核时发现静默期又有活动，本轮不定稿
    NotDue,
    AlreadyFinalizing,
    NotFound,
}

/// 登记表全局计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryTotals {
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
}

/// 研究导出的序列视图，交给定稿流程
#[derive(Debug, Clone)]
pub struct SeriesExport {
    pub series_uid: String,
    pub modality: String,
    pub datasets: Vec<DicomDataset>,
}

/// 定稿时导出的完整研究
#[derive(Debug, Clone)]
pub struct StudyExport {
    pub study_uid: String,
    pub series: Vec<SeriesExport>,
}

impl StudyExport {
    pub fn instance_count(&self) -> usize {
        self.series.iter().map(|s| s.datasets.len()).sum()
    }
}

/// 研究登记表
pub struct StudyRegistry {
    filter: SeriesFilter,
    studies: RwLock<HashMap<String, Arc<Mutex<StudyRecord>>>>,
}

impl StudyRegistry {
    pub fn new(filter: SeriesFilter) -> Self {
        Self {
            filter,
            studies: RwLock::new(HashMap::new()),
        }
    }

    /// 写入一个实例
    ///
    /// 模态排除在创建研究记录之前完成，被排除的首个实例不会留下空研究。
    /// 序列裁决在研究锁内进行，结果与到达顺序无关。
    pub async fn upsert(&self, dataset: &DicomDataset) -> UpsertOutcome {
        let (study_uid, series_uid, sop_uid) = match (
            dataset.require(tags::STUDY_INSTANCE_UID),
            dataset.require(tags::SERIES_INSTANCE_UID),
            dataset.require(tags::SOP_INSTANCE_UID),
        ) {
            (Ok(study), Ok(series), Ok(sop)) => {
                (study.to_string(), series.to_string(), sop.to_string())
            }
            _ => {
                return UpsertOutcome::Rejected(RejectReason::InvalidDataset(
                    "缺少研究/序列/实例UID".to_string(),
                ))
            }
        };

        if let Some(reason) = self.filter.screen(dataset) {
            debug!(study_uid = %study_uid, "实例被模态排除: {}", reason.code());
            return UpsertOutcome::Rejected(reason);
        }

        let (record, created) = self.get_or_create(&study_uid).await;
        let mut record = record.lock().await;

        if record.status != StudyStatus::Active {
            warn!(
                study_uid = %study_uid,
                status = record.status.as_str(),
                "研究已离开接收阶段，迟到实例被拒绝"
            );
            return UpsertOutcome::Rejected(RejectReason::LateArrival);
        }

        if record
            .series
            .values()
            .any(|s| s.instances.contains_key(&sop_uid))
        {
            return UpsertOutcome::Rejected(RejectReason::DuplicateInstance);
        }

        if !record.series.contains_key(&series_uid) {
            let existing: Vec<_> = record
                .series
                .values()
                .map(|s| crate::filter::SeriesView {
                    series_uid: s.series_uid.clone(),
                    original: s.original,
                    acquisition_key: s.acquisition_key.clone(),
                })
                .collect();

            match self.filter.resolve_series(dataset, &existing) {
                SeriesResolution::Reject(reason) => {
                    debug!(
                        study_uid = %study_uid,
                        series_uid = %series_uid,
                        "序列被策略拒绝: {}",
                        reason.code()
                    );
                    return UpsertOutcome::Rejected(reason);
                }
                SeriesResolution::Accept {
                    original,
                    acquisition_key,
                    evict,
                } => {
                    for evicted in &evict {
                        record.series.remove(evicted);
                        info!(
                            study_uid = %study_uid,
                            evicted_series = %evicted,
                            replacement = %series_uid,
                            "原始序列到达，驱逐同采集的衍生序列"
                        );
                    }
                    record.series.insert(
                        series_uid.clone(),
                        SeriesRecord {
                            series_uid: series_uid.clone(),
                            modality: dataset
                                .get(tags::MODALITY)
                                .unwrap_or_default()
                                .to_string(),
                            original,
                            acquisition_key,
                            instances: BTreeMap::new(),
                        },
                    );
                }
            }
        }

        // 序列记录在上方已确保存在
        if let Some(series) = record.series.get_mut(&series_uid) {
            series.instances.insert(
                sop_uid.clone(),
                InstanceRecord {
                    sop_instance_uid: sop_uid.clone(),
                    dataset: dataset.clone(),
                    received_at: Utc::now(),
                },
            );
        }
        record.last_activity_at = Utc::now();

        if created {
            info!(study_uid = %study_uid, "创建新研究");
            UpsertOutcome::Created {
                study_uid,
                series_uid,
                sop_instance_uid: sop_uid,
            }
        } else {
            UpsertOutcome::Updated {
                study_uid,
                series_uid,
                sop_instance_uid: sop_uid,
            }
        }
    }

    async fn get_or_create(&self, study_uid: &str) -> (Arc<Mutex<StudyRecord>>, bool) {
        {
            let studies = self.studies.read().await;
            if let Some(record) = studies.get(study_uid) {
                return (Arc::clone(record), false);
            }
        }
        let mut studies = self.studies.write().await;
        // 双重检查，两个首例并发到达时只创建一次
        if let Some(record) = studies.get(study_uid) {
            return (Arc::clone(record), false);
        }
        let record = Arc::new(Mutex::new(StudyRecord::new(study_uid)));
        studies.insert(study_uid.to_string(), Arc::clone(&record));
        (record, true)
    }

    pub async fn get(&self, study_uid: &str) -> Option<StudySummary> {
        let record = {
            let studies = self.studies.read().await;
            studies.get(study_uid).cloned()
        }?;
        let record = record.lock().await;
        Some(record.summary())
    }

    pub async fn list(&self) -> Vec<StudySummary> {
        let records: Vec<_> = {
            let studies = self.studies.read().await;
            studies.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            summaries.push(record.lock().await.summary());
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// 登记表全局计数，供仪表盘使用
    pub async fn totals(&self) -> RegistryTotals {
        let mut totals = RegistryTotals::default();
        for summary in self.list().await {
            totals.studies += 1;
            totals.series += summary.series_count;
            totals.instances += summary.instance_count;
        }
        totals
    }

    /// 把研究从 active 迁移到 finalizing
    ///
    /// 这是离开 active 的唯一路径；重复调用安全，
    /// 第二次返回`AlreadyFinalizing`，调用方据此跳过。
    ///
    /// 到期判定在研究锁内复核：扫描收集与标记之间接收的实例刷新了
    /// `last_activity_at`，此时返回`NotDue`，研究留在 active 等下一轮。
    pub async fn mark_finalizing(
        &self,
        study_uid: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> MarkOutcome {
        let record = {
            let studies = self.studies.read().await;
            studies.get(study_uid).cloned()
        };
        let Some(record) = record else {
            return MarkOutcome::NotFound;
        };
        let mut record = record.lock().await;
        match record.status {
            StudyStatus::Active => {
                if now - record.last_activity_at < timeout {
                    return MarkOutcome::NotDue;
                }
                record.status = StudyStatus::Finalizing;
                MarkOutcome::Marked
            }
            _ => MarkOutcome::AlreadyFinalizing,
        }
    }

    /// 标记不可恢复失败，记录保留用于排查
    pub async fn mark_failed(&self, study_uid: &str) {
        let record = {
            let studies = self.studies.read().await;
            studies.get(study_uid).cloned()
        };
        if let Some(record) = record {
            let mut record = record.lock().await;
            record.status = StudyStatus::Failed;
        }
    }

    /// 归档成功后移除研究
    pub async fn remove(&self, study_uid: &str) {
        let mut studies = self.studies.write().await;
        studies.remove(study_uid);
    }

    /// 静默超过`timeout`的活动研究
    ///
    /// `now`由调用方注入，测试无需真实计时器。
    pub async fn due_for_completion(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Vec<String> {
        let records: Vec<_> = {
            let studies = self.studies.read().await;
            studies.values().cloned().collect()
        };
        let mut due = Vec::new();
        for record in records {
            let record = record.lock().await;
            if record.status == StudyStatus::Active
                && now - record.last_activity_at >= timeout
            {
                due.push(record.study_uid.clone());
            }
        }
        due.sort();
        due
    }

    /// 导出研究全部数据集的克隆，交给定稿流程
    pub async fn export(&self, study_uid: &str) -> Option<StudyExport> {
        let record = {
            let studies = self.studies.read().await;
            studies.get(study_uid).cloned()
        }?;
        let record = record.lock().await;
        let mut series: Vec<SeriesExport> = record
            .series
            .values()
            .map(|s| SeriesExport {
                series_uid: s.series_uid.clone(),
                modality: s.modality.clone(),
                datasets: s.instances.values().map(|i| i.dataset.clone()).collect(),
            })
            .collect();
        series.sort_by(|a, b| a.series_uid.cmp(&b.series_uid));
        Some(StudyExport {
            study_uid: record.study_uid.clone(),
            series,
        })
    }
}

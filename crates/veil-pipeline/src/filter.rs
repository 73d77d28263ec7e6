//! 序列过滤策略
//!
//! 两条独立策略：模态排除（进入登记表之前）与同采集只保留原始序列。
//! 过滤器只负责计算决策，决策在登记表的研究临界区内被应用，
//! 因此序列规则对到达顺序不敏感。

use std::collections::HashSet;

use veil_core::config::SeriesFilterConfig;
use veil_core::models::tags;
use veil_core::{DicomDataset, RejectReason};

/// 采集身份
///
/// 两个序列共享FrameOfReferenceUID时视为同一次采集；
/// 缺少时退回 模态 + 采集号。两者皆缺的序列彼此不可区分，
/// 不参与原始/衍生裁决，先到先留。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AcquisitionKey {
    FrameOfReference(String),
    ModalityAcquisition(String, String),
}

/// 登记表中已存在序列的裁决视图
#[derive(Debug, Clone)]
pub struct SeriesView {
    pub series_uid: String,
    pub original: bool,
    pub acquisition_key: Option<AcquisitionKey>,
}

/// 序列裁决结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesResolution {
    /// 接收；`evict`列出因原始序列到达而被替换的衍生序列
    Accept {
        original: bool,
        acquisition_key: Option<AcquisitionKey>,
        evict: Vec<String>,
    },
    Reject(RejectReason),
}

/// 序列过滤器
#[derive(Debug, Clone)]
pub struct SeriesFilter {
    exclude_modalities: HashSet<String>,
    keep_original_series: bool,
}

impl SeriesFilter {
    pub fn new(config: &SeriesFilterConfig) -> Self {
        Self {
            exclude_modalities: config
                .exclude_modalities
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .collect(),
            keep_original_series: config.keep_original_series,
        }
    }

    /// 模态排除检查，在创建任何研究记录之前执行
    pub fn screen(&self, dataset: &DicomDataset) -> Option<RejectReason> {
        let modality = dataset.get(tags::MODALITY)?.trim().to_ascii_uppercase();
        if self.exclude_modalities.contains(&modality) {
            return Some(RejectReason::ExcludedModality(modality));
        }
        None
    }

    /// 对一个新序列的首个实例做裁决
    ///
    /// `existing`是同一研究内已接收序列的视图，调用方持有研究锁。
    pub fn resolve_series(
        &self,
        incoming: &DicomDataset,
        existing: &[SeriesView],
    ) -> SeriesResolution {
        let original = is_original(incoming);
        let key = acquisition_key(incoming);

        if !self.keep_original_series {
            return SeriesResolution::Accept {
                original,
                acquisition_key: key,
                evict: Vec::new(),
            };
        }

        // 无采集身份的序列不可区分，先到先留
        let Some(key) = key else {
            return SeriesResolution::Accept {
                original,
                acquisition_key: None,
                evict: Vec::new(),
            };
        };

        let same_acquisition: Vec<&SeriesView> = existing
            .iter()
            .filter(|view| view.acquisition_key.as_ref() == Some(&key))
            .collect();

        if !original && same_acquisition.iter().any(|view| view.original) {
            return SeriesResolution::Reject(RejectReason::NonOriginalSeries);
        }

        let evict = if original {
            same_acquisition
                .iter()
                .filter(|view| !view.original)
                .map(|view| view.series_uid.clone())
                .collect()
        } else {
            Vec::new()
        };

        SeriesResolution::Accept {
            original,
            acquisition_key: Some(key),
            evict,
        }
    }
}

/// ImageType多值中含`ORIGINAL`即为原始序列；缺少ImageType按原始处理
pub fn is_original(dataset: &DicomDataset) -> bool {
    match dataset.get(tags::IMAGE_TYPE) {
        Some(value) => value
            .split('\\')
            .any(|part| part.trim().eq_ignore_ascii_case("ORIGINAL")),
        None => true,
    }
}

/// 提取采集身份键
pub fn acquisition_key(dataset: &DicomDataset) -> Option<AcquisitionKey> {
    if let Some(frame) = dataset.get(tags::FRAME_OF_REFERENCE_UID) {
        if !frame.trim().is_empty() {
            return Some(AcquisitionKey::FrameOfReference(frame.trim().to_string()));
        }
    }
    match (
        dataset.get(tags::MODALITY),
        dataset.get(tags::ACQUISITION_NUMBER),
    ) {
        (Some(modality), Some(acq)) if !acq.trim().is_empty() => Some(
            AcquisitionKey::ModalityAcquisition(
                modality.trim().to_ascii_uppercase(),
                acq.trim().to_string(),
            ),
        ),
        _ => None,
    }
}

//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VeilError};

/// 常用DICOM标签关键字
///
/// 数据集在核心管线中以 关键字 → 字符串值 的形式流转，
/// 这里集中定义管线各环节引用的关键字常量。
pub mod tags {
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_ID: &str = "PatientID";
    pub const PATIENT_BIRTH_DATE: &str = "PatientBirthDate";
    pub const PATIENT_SEX: &str = "PatientSex";
    pub const PATIENT_AGE: &str = "PatientAge";
    pub const PATIENT_ADDRESS: &str = "PatientAddress";
    pub const PATIENT_WEIGHT: &str = "PatientWeight";

    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const STUDY_DATE: &str = "StudyDate";
    pub const STUDY_TIME: &str = "StudyTime";
    pub const STUDY_ID: &str = "StudyID";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const ACCESSION_NUMBER: &str = "AccessionNumber";
    pub const REFERRING_PHYSICIAN_NAME: &str = "ReferringPhysicianName";

    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SERIES_NUMBER: &str = "SeriesNumber";
    pub const SERIES_DATE: &str = "SeriesDate";
    pub const SERIES_TIME: &str = "SeriesTime";
    pub const SERIES_DESCRIPTION: &str = "SeriesDescription";
    pub const MODALITY: &str = "Modality";
    pub const IMAGE_TYPE: &str = "ImageType";
    pub const ACQUISITION_NUMBER: &str = "AcquisitionNumber";
    pub const ACQUISITION_DATE: &str = "AcquisitionDate";
    pub const FRAME_OF_REFERENCE_UID: &str = "FrameOfReferenceUID";
    pub const BODY_PART_EXAMINED: &str = "BodyPartExamined";

    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const SOP_CLASS_UID: &str = "SOPClassUID";
    pub const INSTANCE_NUMBER: &str = "InstanceNumber";
    pub const CONTENT_DATE: &str = "ContentDate";
    pub const CONTENT_TIME: &str = "ContentTime";
    pub const INSTANCE_CREATION_DATE: &str = "InstanceCreationDate";
    pub const INSTANCE_CREATION_TIME: &str = "InstanceCreationTime";

    pub const INSTITUTION_NAME: &str = "InstitutionName";
    pub const INSTITUTION_ADDRESS: &str = "InstitutionAddress";
    pub const OPERATORS_NAME: &str = "OperatorsName";
    pub const PERFORMING_PHYSICIAN_NAME: &str = "PerformingPhysicianName";
    pub const STATION_NAME: &str = "StationName";
    pub const MANUFACTURER: &str = "Manufacturer";
    pub const MANUFACTURER_MODEL_NAME: &str = "ManufacturerModelName";
    pub const DEVICE_SERIAL_NUMBER: &str = "DeviceSerialNumber";
    pub const BURNED_IN_ANNOTATION: &str = "BurnedInAnnotation";
}

/// DICOM数据集的标签视图
///
/// 传输层完成解码后，核心管线只处理这种 关键字 → 字符串值 的映射。
/// 使用`BTreeMap`保证序列化输出的字段顺序稳定。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DicomDataset {
    elements: BTreeMap<String, String>,
}

impl DicomDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.elements.get(keyword).map(|v| v.as_str())
    }

    /// 读取必需标签，缺失时返回验证错误
    pub fn require(&self, keyword: &str) -> Result<&str> {
        self.get(keyword)
            .ok_or_else(|| VeilError::Validation(format!("缺少必需标签: {}", keyword)))
    }

    pub fn set(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        self.elements.insert(keyword.into(), value.into());
    }

    pub fn remove(&mut self, keyword: &str) -> Option<String> {
        self.elements.remove(keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.elements.contains_key(keyword)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.elements.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl FromIterator<(String, String)> for DicomDataset {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

/// 会话元数据
///
/// 由传输层在关联协商完成后提供，随数据集一起进入管线。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    /// 发起方AE标题
    pub calling_ae_title: String,
    /// 接收方AE标题
    pub called_ae_title: String,
    /// 已协商的传输语法
    pub transfer_syntax_uid: Option<String>,
    /// 对端地址
    pub remote_addr: Option<String>,
}

/// 研究状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StudyStatus {
    /// 正在接收影像
    Active,
    /// 已由完成监视器判定结束，进入匿名化与归档
    Finalizing,
    /// 归档成功并已发布
    Completed,
    /// 不可恢复失败，保留记录用于排查
    Failed,
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// 拒绝原因代码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// 数据集缺少必需标签或格式非法
    InvalidDataset(String),
    /// 模态在排除列表中
    ExcludedModality(String),
    /// 同一采集已存在原始序列，衍生序列被丢弃
    NonOriginalSeries,
    /// 同一SOP实例重复接收
    DuplicateInstance,
    /// 研究已进入定稿流程，迟到实例不再接收
    LateArrival,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDataset(_) => "invalid_dataset",
            Self::ExcludedModality(_) => "excluded_modality",
            Self::NonOriginalSeries => "non_original_series",
            Self::DuplicateInstance => "duplicate_instance",
            Self::LateArrival => "late_arrival",
        }
    }
}

/// 单个实例的接收结果，返回给传输层
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AcceptResult {
    Accepted {
        study_uid: String,
        series_uid: String,
        sop_instance_uid: String,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl AcceptResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// 研究的只读快照，供监视器与Web层使用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_uid: String,
    pub status: StudyStatus,
    pub series_count: usize,
    pub instance_count: usize,
    pub modalities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

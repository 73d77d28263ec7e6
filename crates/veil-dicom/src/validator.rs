//! 数据集规范化校验
//!
//! 实例进入研究装配之前的最后一道门：必需标签齐全且UID格式合法，
//! 否则拒绝，不会产生任何研究状态变化。

use tracing::debug;

use veil_core::models::tags;
use veil_core::utils::is_valid_dicom_uid;
use veil_core::{DicomDataset, Result, VeilError};

/// 进入装配管线必须具备的标签
const REQUIRED_TAGS: &[&str] = &[
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::SOP_INSTANCE_UID,
    tags::MODALITY,
];

/// 其中必须符合UID格式的标签
const UID_TAGS: &[&str] = &[
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::SOP_INSTANCE_UID,
];

/// 数据集校验器
pub struct DatasetValidator;

impl DatasetValidator {
    /// 校验必需标签的存在与格式
    pub fn validate(dataset: &DicomDataset) -> Result<()> {
        let mut missing = Vec::new();
        for keyword in REQUIRED_TAGS {
            match dataset.get(keyword) {
                Some(value) if !value.trim().is_empty() => {}
                _ => missing.push(*keyword),
            }
        }
        if !missing.is_empty() {
            return Err(VeilError::Validation(format!(
                "缺少必需标签: {}",
                missing.join(", ")
            )));
        }

        for keyword in UID_TAGS {
            // 上面已确认存在
            let value = dataset.require(keyword)?;
            if !is_valid_dicom_uid(value) {
                return Err(VeilError::Validation(format!(
                    "{} 格式无效: {}",
                    keyword, value
                )));
            }
        }

        debug!(
            study_uid = dataset.get(tags::STUDY_INSTANCE_UID).unwrap_or(""),
            "数据集校验通过"
        );
        Ok(())
    }
}

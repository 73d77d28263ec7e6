//! 匿名化引擎
//!
//! 对单个数据集的匿名化是 (规则集, 数据集, UID重映射表, 新身份) 的纯函数。
//! UID重映射表以研究为单位，保证研究内部的交叉引用在匿名化后仍然互相可解析；
//! 生成过的UID也映射到自身，因此对已匿名化的数据集重复执行结果不变。
//!
//! 外部标识（PatientID、AccessionNumber）替换为每研究新生成的值，
//! 任何输出与磁盘上都不保留反向映射。

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use tracing::warn;
use uuid::Uuid;

use veil_core::models::tags;
use veil_core::utils::generate_dicom_uid;
use veil_core::{DicomDataset, Result, VeilError};

/// 匿名化哈希值前缀
const HASH_PREFIX: &str = "ANON-";
/// 哈希值保留的十六进制位数
const HASH_LEN: usize = 16;

/// 单个标签的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAction {
    /// 原样保留（未列出标签的默认动作）
    Keep,
    /// 从输出中删除
    Remove,
    /// 置为空串
    Blank,
    /// SHA-256哈希，保留可关联性但不可逆
    Hash,
    /// 日期泛化为当年1月1日
    GeneralizeDate,
    /// 替换为固定文本
    ReplaceText(String),
    /// 通过研究级重映射表换为新UID
    RemapUid,
    /// 替换为每研究新生成的外部标识
    ReplaceFresh,
}

/// 命名规则集
#[derive(Debug, Clone)]
pub struct AnonymizationProfile {
    pub name: String,
    actions: HashMap<&'static str, TagAction>,
}

impl AnonymizationProfile {
    /// 严格规则集：删除或泛化全部直接标识
    pub fn compliance() -> Self {
        use TagAction::*;
        let actions = HashMap::from([
            (tags::PATIENT_NAME, ReplaceText("ANONYMIZED".to_string())),
            (tags::PATIENT_ID, ReplaceFresh),
            (tags::ACCESSION_NUMBER, ReplaceFresh),
            (tags::PATIENT_BIRTH_DATE, GeneralizeDate),
            (tags::PATIENT_AGE, Remove),
            (tags::PATIENT_ADDRESS, Remove),
            (tags::PATIENT_WEIGHT, Remove),
            (tags::REFERRING_PHYSICIAN_NAME, Remove),
            (tags::PERFORMING_PHYSICIAN_NAME, Remove),
            (tags::OPERATORS_NAME, Remove),
            (tags::INSTITUTION_NAME, Hash),
            (tags::INSTITUTION_ADDRESS, Remove),
            (tags::STATION_NAME, Hash),
            (tags::DEVICE_SERIAL_NUMBER, Hash),
            (tags::STUDY_ID, Blank),
            (tags::STUDY_DATE, GeneralizeDate),
            (tags::SERIES_DATE, GeneralizeDate),
            (tags::ACQUISITION_DATE, GeneralizeDate),
            (tags::CONTENT_DATE, GeneralizeDate),
            (tags::INSTANCE_CREATION_DATE, GeneralizeDate),
            (tags::STUDY_TIME, Blank),
            (tags::SERIES_TIME, Blank),
            (tags::CONTENT_TIME, Blank),
            (tags::INSTANCE_CREATION_TIME, Blank),
            (tags::STUDY_INSTANCE_UID, RemapUid),
            (tags::SERIES_INSTANCE_UID, RemapUid),
            (tags::SOP_INSTANCE_UID, RemapUid),
            (tags::FRAME_OF_REFERENCE_UID, RemapUid),
        ]);
        Self {
            name: "compliance".to_string(),
            actions,
        }
    }

    /// 科研规则集：保留日期与机构信息，直接标识仍被处理
    pub fn research() -> Self {
        use TagAction::*;
        let actions = HashMap::from([
            (tags::PATIENT_NAME, ReplaceText("ANONYMIZED".to_string())),
            (tags::PATIENT_ID, ReplaceFresh),
            (tags::ACCESSION_NUMBER, ReplaceFresh),
            (tags::PATIENT_BIRTH_DATE, GeneralizeDate),
            (tags::PATIENT_ADDRESS, Remove),
            (tags::REFERRING_PHYSICIAN_NAME, Remove),
            (tags::PERFORMING_PHYSICIAN_NAME, Remove),
            (tags::OPERATORS_NAME, Remove),
            (tags::INSTITUTION_ADDRESS, Remove),
            (tags::STUDY_INSTANCE_UID, RemapUid),
            (tags::SERIES_INSTANCE_UID, RemapUid),
            (tags::SOP_INSTANCE_UID, RemapUid),
            (tags::FRAME_OF_REFERENCE_UID, RemapUid),
        ]);
        Self {
            name: "research".to_string(),
            actions,
        }
    }

    /// 按名称选择规则集，未知名称回落到严格规则集
    pub fn by_name(name: &str) -> Self {
        match name {
            "compliance" => Self::compliance(),
            "research" => Self::research(),
            other => {
                warn!("未知的匿名化规则集 {:?}，使用compliance", other);
                Self::compliance()
            }
        }
    }

    pub fn action(&self, keyword: &str) -> &TagAction {
        self.actions.get(keyword).unwrap_or(&TagAction::Keep)
    }
}

/// 研究级UID重映射表
///
/// 原UID → 新UID的映射只增不改；生成过的UID映射到自身，
/// 因此同一张表下重复匿名化是幂等的。
#[derive(Debug, Clone)]
pub struct UidRemap {
    uid_root: String,
    forward: HashMap<String, String>,
    generated: HashSet<String>,
}

impl UidRemap {
    pub fn new(uid_root: &str) -> Self {
        Self {
            uid_root: uid_root.to_string(),
            forward: HashMap::new(),
            generated: HashSet::new(),
        }
    }

    /// 查询或生成映射
    pub fn map(&mut self, original: &str) -> Result<String> {
        let original = original.trim();
        if original.is_empty() {
            return Err(VeilError::Anonymization("空UID无法重映射".to_string()));
        }
        if self.generated.contains(original) {
            return Ok(original.to_string());
        }
        if let Some(mapped) = self.forward.get(original) {
            return Ok(mapped.clone());
        }
        let generated = generate_dicom_uid(&self.uid_root);
        self.forward
            .insert(original.to_string(), generated.clone());
        self.generated.insert(generated.clone());
        Ok(generated)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// 每研究新生成的外部标识
///
/// 在首次定稿尝试时生成一次并在重试间复用，归档内容因此可确定重放。
#[derive(Debug, Clone)]
pub struct FreshIdentifiers {
    pub patient_id: String,
    pub accession_number: String,
}

impl FreshIdentifiers {
    pub fn generate() -> Self {
        Self {
            patient_id: format!("PID{}", short_token()),
            accession_number: format!("ACC{}", short_token()),
        }
    }
}

fn short_token() -> String {
    let uuid = Uuid::new_v4();
    let mut token = String::with_capacity(12);
    for byte in &uuid.as_bytes()[..6] {
        let _ = write!(token, "{:02X}", byte);
    }
    token
}

/// 匿名化单个数据集
pub fn anonymize(
    profile: &AnonymizationProfile,
    dataset: &DicomDataset,
    remap: &mut UidRemap,
    fresh: &FreshIdentifiers,
) -> Result<DicomDataset> {
    let mut output = DicomDataset::new();
    for (keyword, value) in dataset.iter() {
        match profile.action(keyword) {
            TagAction::Keep => output.set(keyword, value),
            TagAction::Remove => {}
            TagAction::Blank => output.set(keyword, ""),
            TagAction::Hash => output.set(keyword, hash_value(value)),
            TagAction::GeneralizeDate => output.set(keyword, generalize_date(value)),
            TagAction::ReplaceText(text) => output.set(keyword, text.clone()),
            TagAction::RemapUid => output.set(keyword, remap.map(value)?),
            TagAction::ReplaceFresh => match keyword {
                tags::PATIENT_ID => output.set(keyword, fresh.patient_id.clone()),
                tags::ACCESSION_NUMBER => {
                    output.set(keyword, fresh.accession_number.clone())
                }
                other => {
                    return Err(VeilError::Anonymization(format!(
                        "标签 {} 没有对应的新标识",
                        other
                    )))
                }
            },
        }
    }
    Ok(output)
}

/// 已是匿名化哈希形态的值保持不变，重复执行是无操作
fn hash_value(value: &str) -> String {
    if is_hash_token(value) {
        return value.to_string();
    }
    let digest = Sha256::digest(value.as_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter() {
        let _ = write!(hex, "{:02X}", byte);
        if hex.len() >= HASH_LEN {
            break;
        }
    }
    hex.truncate(HASH_LEN);
    format!("{}{}", HASH_PREFIX, hex)
}

fn is_hash_token(value: &str) -> bool {
    value
        .strip_prefix(HASH_PREFIX)
        .map(|rest| {
            rest.len() == HASH_LEN
                && rest
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
        .unwrap_or(false)
}

/// 日期泛化为当年1月1日，无法识别的值置空
///
/// 用`get`取前四个字节，多字节字符落在边界上时按无法识别处理，不会恐慌。
fn generalize_date(value: &str) -> String {
    let value = value.trim();
    match value.get(..4) {
        Some(year) if year.chars().all(|c| c.is_ascii_digit()) => format!("{}0101", year),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> DicomDataset {
        let mut dataset = DicomDataset::new();
        dataset.set(tags::PATIENT_NAME, "DOE^JANE");
        dataset.set(tags::PATIENT_ID, "HOSP-001234");
        dataset.set(tags::PATIENT_BIRTH_DATE, "19731120");
        dataset.set(tags::PATIENT_ADDRESS, "1 Main St");
        dataset.set(tags::ACCESSION_NUMBER, "A-2024-5678");
        dataset.set(tags::STUDY_INSTANCE_UID, "1.2.840.1.1");
        dataset.set(tags::SERIES_INSTANCE_UID, "1.2.840.1.1.1");
        dataset.set(tags::SOP_INSTANCE_UID, "1.2.840.1.1.1.1");
        dataset.set(tags::FRAME_OF_REFERENCE_UID, "1.2.840.1.9");
        dataset.set(tags::STUDY_DATE, "20240315");
        dataset.set(tags::INSTITUTION_NAME, "General Hospital");
        dataset.set(tags::MODALITY, "CT");
        dataset
    }

    #[test]
    fn test_compliance_profile_removes_direct_identifiers() {
        let profile = AnonymizationProfile::compliance();
        let mut remap = UidRemap::new("2.25");
        let fresh = FreshIdentifiers::generate();

        let output = anonymize(&profile, &sample_dataset(), &mut remap, &fresh).unwrap();

        assert_eq!(output.get(tags::PATIENT_NAME), Some("ANONYMIZED"));
        assert!(!output.contains(tags::PATIENT_ADDRESS));
        assert_eq!(output.get(tags::PATIENT_BIRTH_DATE), Some("19730101"));
        assert_eq!(output.get(tags::STUDY_DATE), Some("20240101"));
        assert_eq!(output.get(tags::MODALITY), Some("CT"));
        // 机构名被哈希而非保留
        let institution = output.get(tags::INSTITUTION_NAME).unwrap();
        assert!(institution.starts_with("ANON-"));
        assert_ne!(institution, "General Hospital");
    }

    #[test]
    fn test_external_identifiers_have_no_reverse_mapping() {
        let profile = AnonymizationProfile::compliance();
        let mut remap = UidRemap::new("2.25");
        let fresh = FreshIdentifiers::generate();

        let output = anonymize(&profile, &sample_dataset(), &mut remap, &fresh).unwrap();

        let patient_id = output.get(tags::PATIENT_ID).unwrap();
        assert_eq!(patient_id, fresh.patient_id);
        assert_ne!(patient_id, "HOSP-001234");
        // 新标识与原值无函数关系，重映射表中也没有它们
        assert!(remap.forward.get("HOSP-001234").is_none());
        assert!(remap.forward.get("A-2024-5678").is_none());
    }

    #[test]
    fn test_cross_references_stay_consistent() {
        let profile = AnonymizationProfile::compliance();
        let mut remap = UidRemap::new("2.25");
        let fresh = FreshIdentifiers::generate();

        let mut second = sample_dataset();
        second.set(tags::SOP_INSTANCE_UID, "1.2.840.1.1.1.2");

        let a = anonymize(&profile, &sample_dataset(), &mut remap, &fresh).unwrap();
        let b = anonymize(&profile, &second, &mut remap, &fresh).unwrap();

        // 同一研究的两个实例映射到同一个新研究UID与参考系UID
        assert_eq!(
            a.get(tags::STUDY_INSTANCE_UID),
            b.get(tags::STUDY_INSTANCE_UID)
        );
        assert_eq!(
            a.get(tags::FRAME_OF_REFERENCE_UID),
            b.get(tags::FRAME_OF_REFERENCE_UID)
        );
        // 不同实例得到不同的新SOP UID
        assert_ne!(
            a.get(tags::SOP_INSTANCE_UID),
            b.get(tags::SOP_INSTANCE_UID)
        );
    }

    #[test]
    fn test_anonymization_is_idempotent() {
        let profile = AnonymizationProfile::compliance();
        let mut remap = UidRemap::new("2.25");
        let fresh = FreshIdentifiers::generate();

        let once = anonymize(&profile, &sample_dataset(), &mut remap, &fresh).unwrap();
        let twice = anonymize(&profile, &once, &mut remap, &fresh).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_uid_fails_remap() {
        let mut remap = UidRemap::new("2.25");
        assert!(remap.map("").is_err());
        assert!(remap.map("   ").is_err());
    }

    #[test]
    fn test_generalize_date_handles_malformed_values() {
        assert_eq!(generalize_date("20240315"), "20240101");
        assert_eq!(generalize_date("1999"), "19990101");
        assert_eq!(generalize_date("abc"), "");
        assert_eq!(generalize_date(""), "");
        // 多字节字符不在字节边界上也不能恐慌
        assert_eq!(generalize_date("日期不明"), "");
        assert_eq!(generalize_date("２０２４"), "");
    }

    #[test]
    fn test_multibyte_date_value_survives_anonymization() {
        let profile = AnonymizationProfile::compliance();
        let mut remap = UidRemap::new("2.25");
        let fresh = FreshIdentifiers::generate();

        let mut dataset = sample_dataset();
        dataset.set(tags::PATIENT_BIRTH_DATE, "日期不明");

        let output = anonymize(&profile, &dataset, &mut remap, &fresh).unwrap();
        assert_eq!(output.get(tags::PATIENT_BIRTH_DATE), Some(""));
    }

    #[test]
    fn test_hash_is_stable_and_shaped() {
        let a = hash_value("General Hospital");
        let b = hash_value("General Hospital");
        assert_eq!(a, b);
        assert!(is_hash_token(&a));
        assert_eq!(hash_value(&a), a);
    }

    #[test]
    fn test_unknown_profile_falls_back_to_compliance() {
        let profile = AnonymizationProfile::by_name("nonsense");
        assert_eq!(profile.name, "compliance");
        assert_eq!(AnonymizationProfile::by_name("research").name, "research");
    }
}

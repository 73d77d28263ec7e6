//! DICOM数据解析器
//!
//! 将已接收完整的DICOM对象转换为核心管线使用的标签视图。
//! 提取表覆盖身份、研究、序列、实例与设备相关的标签，
//! 像素数据不进入管线。

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{from_reader, open_file, DefaultDicomObject};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, error};

use veil_core::models::tags as keywords;
use veil_core::{DicomDataset, Result, VeilError};

/// 文件前导区长度加上"DICM"魔数
const PREAMBLE_LEN: usize = 132;

/// 解析结果：标签视图加上文件元信息里的传输语法
#[derive(Debug, Clone)]
pub struct ParsedInstance {
    pub dataset: DicomDataset,
    pub transfer_syntax_uid: String,
}

/// 提取表：DICOM标签 → 管线关键字
const EXTRACTED_TAGS: &[(Tag, &str)] = &[
    (tags::PATIENT_NAME, keywords::PATIENT_NAME),
    (tags::PATIENT_ID, keywords::PATIENT_ID),
    (tags::PATIENT_BIRTH_DATE, keywords::PATIENT_BIRTH_DATE),
    (tags::PATIENT_SEX, keywords::PATIENT_SEX),
    (tags::PATIENT_AGE, keywords::PATIENT_AGE),
    (tags::PATIENT_ADDRESS, keywords::PATIENT_ADDRESS),
    (tags::PATIENT_WEIGHT, keywords::PATIENT_WEIGHT),
    (tags::STUDY_INSTANCE_UID, keywords::STUDY_INSTANCE_UID),
    (tags::STUDY_DATE, keywords::STUDY_DATE),
    (tags::STUDY_TIME, keywords::STUDY_TIME),
    (tags::STUDY_ID, keywords::STUDY_ID),
    (tags::STUDY_DESCRIPTION, keywords::STUDY_DESCRIPTION),
    (tags::ACCESSION_NUMBER, keywords::ACCESSION_NUMBER),
    (
        tags::REFERRING_PHYSICIAN_NAME,
        keywords::REFERRING_PHYSICIAN_NAME,
    ),
    (tags::SERIES_INSTANCE_UID, keywords::SERIES_INSTANCE_UID),
    (tags::SERIES_NUMBER, keywords::SERIES_NUMBER),
    (tags::SERIES_DATE, keywords::SERIES_DATE),
    (tags::SERIES_TIME, keywords::SERIES_TIME),
    (tags::SERIES_DESCRIPTION, keywords::SERIES_DESCRIPTION),
    (tags::MODALITY, keywords::MODALITY),
    (tags::IMAGE_TYPE, keywords::IMAGE_TYPE),
    (tags::ACQUISITION_NUMBER, keywords::ACQUISITION_NUMBER),
    (tags::ACQUISITION_DATE, keywords::ACQUISITION_DATE),
    (
        tags::FRAME_OF_REFERENCE_UID,
        keywords::FRAME_OF_REFERENCE_UID,
    ),
    (tags::BODY_PART_EXAMINED, keywords::BODY_PART_EXAMINED),
    (tags::SOP_INSTANCE_UID, keywords::SOP_INSTANCE_UID),
    (tags::SOP_CLASS_UID, keywords::SOP_CLASS_UID),
    (tags::INSTANCE_NUMBER, keywords::INSTANCE_NUMBER),
    (tags::CONTENT_DATE, keywords::CONTENT_DATE),
    (tags::CONTENT_TIME, keywords::CONTENT_TIME),
    (
        tags::INSTANCE_CREATION_DATE,
        keywords::INSTANCE_CREATION_DATE,
    ),
    (
        tags::INSTANCE_CREATION_TIME,
        keywords::INSTANCE_CREATION_TIME,
    ),
    (tags::INSTITUTION_NAME, keywords::INSTITUTION_NAME),
    (tags::INSTITUTION_ADDRESS, keywords::INSTITUTION_ADDRESS),
    (tags::OPERATORS_NAME, keywords::OPERATORS_NAME),
    (
        tags::PERFORMING_PHYSICIAN_NAME,
        keywords::PERFORMING_PHYSICIAN_NAME,
    ),
    (tags::STATION_NAME, keywords::STATION_NAME),
    (tags::MANUFACTURER, keywords::MANUFACTURER),
    (
        tags::MANUFACTURER_MODEL_NAME,
        keywords::MANUFACTURER_MODEL_NAME,
    ),
    (tags::DEVICE_SERIAL_NUMBER, keywords::DEVICE_SERIAL_NUMBER),
    (tags::BURNED_IN_ANNOTATION, keywords::BURNED_IN_ANNOTATION),
];

/// DICOM数据解析器
pub struct DicomParser;

impl DicomParser {
    /// 解析磁盘上的DICOM文件
    pub fn parse_file<P: AsRef<Path>>(file_path: P) -> Result<ParsedInstance> {
        let file_path = file_path.as_ref();
        debug!("解析DICOM文件: {:?}", file_path);

        let obj = open_file(file_path).map_err(|e| {
            error!("DICOM文件解析失败: {:?}", e);
            VeilError::DicomParseError(format!("无法解析DICOM文件: {:?}", e))
        })?;

        Ok(Self::extract(obj))
    }

    /// 解析完整接收的DICOM字节流
    ///
    /// 线上传来的对象可能带128字节前导区与"DICM"魔数，先剥掉再交给解码器。
    pub fn parse_bytes(data: &[u8]) -> Result<ParsedInstance> {
        debug!("解析DICOM字节数据，大小: {} bytes", data.len());

        let body = if data.len() > PREAMBLE_LEN && &data[128..132] == b"DICM" {
            &data[PREAMBLE_LEN..]
        } else {
            data
        };

        let obj = from_reader(Cursor::new(body)).map_err(|e| {
            error!("DICOM字节数据解析失败: {:?}", e);
            VeilError::DicomParseError(format!("无法解析DICOM数据: {:?}", e))
        })?;

        Ok(Self::extract(obj))
    }

    /// 从DICOM对象提取标签视图
    fn extract(obj: DefaultDicomObject) -> ParsedInstance {
        let transfer_syntax_uid = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();

        let mut dataset = DicomDataset::new();
        for (tag, keyword) in EXTRACTED_TAGS {
            if let Some(value) = Self::get_string_element(&obj, *tag) {
                dataset.set(*keyword, value);
            }
        }

        ParsedInstance {
            dataset,
            transfer_syntax_uid,
        }
    }

    fn get_string_element(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|v| v.trim().trim_end_matches('\0').to_string())
            .filter(|v| !v.is_empty())
    }
}

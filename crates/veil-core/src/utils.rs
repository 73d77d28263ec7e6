//! 通用工具函数

use uuid::Uuid;

/// 在给定UID根下生成新的DICOM标识符
///
/// UID整体不得超过64字符，超长时截断并去掉结尾的点。
pub fn generate_dicom_uid(uid_root: &str) -> String {
    let prefix = uid_prefix(uid_root);
    let mut uid = format!("{}{}", prefix, Uuid::new_v4().as_u128());
    if uid.len() > 64 {
        uid.truncate(64);
        while uid.ends_with('.') {
            uid.pop();
        }
    }
    uid
}

/// 将UID根规范化为前缀形式（非空时以点结尾）
pub fn uid_prefix(uid_root: &str) -> String {
    let trimmed = uid_root.trim();
    if trimmed.is_empty() || trimmed.ends_with('.') {
        trimmed.to_string()
    } else {
        format!("{}.", trimmed)
    }
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    if uid.starts_with('.') || uid.ends_with('.') || uid.contains("..") {
        return false;
    }
    uid.chars().all(|c| c.is_ascii_digit() || c == '.')
}

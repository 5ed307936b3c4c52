//! 车牌文本规范化
//!
//! OCR 原始文本 → `STATE-DISTRICT-SERIES-NUMBER`, 例如 `MH 12 AB 1234` → `MH-12-AB-1234`

use once_cell::sync::Lazy;
use regex::Regex;

/// 标准车牌: 2字母 + 1~2数字 + 1~2字母 + 1~4数字 (去掉分隔符后)
static STANDARD_PLATE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}[0-9]{1,2}[A-Z]{1,2}[0-9]{1,4}$").ok());

const MIN_PLATE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlateFormatter;

impl PlateFormatter {
    /// 规范化车牌文本, 不合法时返回空串
    ///
    /// 分组按固定宽度切分 [0..2] [2..4] [4..6] [6..]
    pub fn format(&self, raw: &str) -> String {
        let stripped: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();

        if stripped.len() < MIN_PLATE_LEN {
            return String::new();
        }

        let valid = STANDARD_PLATE
            .as_ref()
            .map(|re| re.is_match(&stripped))
            .unwrap_or(false);
        if !valid {
            return String::new();
        }

        // 只含ASCII, 按字节切分安全
        format!(
            "{}-{}-{}-{}",
            &stripped[0..2],
            &stripped[2..4],
            &stripped[4..6],
            &stripped[6..]
        )
    }
}

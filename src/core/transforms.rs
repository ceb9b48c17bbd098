//! 欄位值轉換
//!
//! 每個轉換都是 `&str -> Option<String>` 的純函式，以名稱查表取得。
//! 回傳 `None` 代表這個映射要被略過；未知名稱不報錯，維持原值。

use base64::Engine;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::fmt::Write;

pub type TransformFn = fn(&str) -> Option<String>;

const DATE_FORMAT_PREFIX: &str = "date-format:";

/// 支援的轉換名稱（`date-format:<pattern>` 除外）
pub const TRANSFORM_NAMES: &[&str] = &[
    "uppercase",
    "lowercase",
    "trim",
    "remove-spaces",
    "remove-all-spaces",
    "capitalize",
    "title-case",
    "remove-accents",
    "format-cpf",
    "format-cnpj",
    "format-phone-br",
    "format-cep",
    "remove-non-numeric",
    "remove-non-alphanumeric",
    "slugify",
    "reverse",
    "base64-encode",
    "url-encode",
    "null-if-empty",
];

#[derive(Debug, Clone)]
pub enum Transform {
    Named(&'static str, TransformFn),
    /// chrono 格式字串
    DateFormat(String),
    Unknown(String),
}

impl Transform {
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        let lowered = trimmed.to_lowercase();

        if lowered.starts_with(DATE_FORMAT_PREFIX) {
            let pattern = to_chrono_pattern(&trimmed[DATE_FORMAT_PREFIX.len()..]);
            if is_valid_chrono_pattern(&pattern) {
                return Transform::DateFormat(pattern);
            }
            return Transform::Unknown(trimmed.to_string());
        }

        match lookup(&lowered) {
            Some((canonical, f)) => Transform::Named(canonical, f),
            None => Transform::Unknown(trimmed.to_string()),
        }
    }

    pub fn apply(&self, value: &str) -> Option<String> {
        match self {
            Transform::Named(_, f) => f(value),
            Transform::DateFormat(pattern) => Some(reformat_date(value, pattern)),
            Transform::Unknown(name) => {
                tracing::trace!("Unknown transform '{}', value kept", name);
                Some(value.to_string())
            }
        }
    }
}

/// 依序套用轉換鏈；任何一步回傳 `None` 即停止
pub fn apply_chain(value: &str, chain: &[Transform]) -> Option<String> {
    chain
        .iter()
        .try_fold(value.to_string(), |current, t| t.apply(&current))
}

pub fn parse_chain(names: &[String]) -> Vec<Transform> {
    names.iter().map(|n| Transform::parse(n)).collect()
}

fn lookup(name: &str) -> Option<(&'static str, TransformFn)> {
    let f: TransformFn = match name {
        "uppercase" => |v| Some(v.to_uppercase()),
        "lowercase" => |v| Some(v.to_lowercase()),
        "trim" => |v| Some(v.trim().to_string()),
        "remove-spaces" => |v| Some(v.replace(' ', "")),
        "remove-all-spaces" => |v| Some(v.chars().filter(|c| !c.is_whitespace()).collect()),
        "capitalize" => |v| Some(capitalize(v)),
        "title-case" => |v| Some(title_case(v)),
        "remove-accents" => |v| Some(remove_accents(v)),
        "format-cpf" => |v| Some(format_cpf(v)),
        "format-cnpj" => |v| Some(format_cnpj(v)),
        "format-phone-br" => |v| Some(format_phone_br(v)),
        "format-cep" => |v| Some(format_cep(v)),
        "remove-non-numeric" => |v| Some(digits(v)),
        "remove-non-alphanumeric" => {
            |v| Some(v.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        }
        "slugify" => |v| Some(slugify(v)),
        "reverse" => |v| Some(v.chars().rev().collect()),
        "base64-encode" => |v| Some(base64::engine::general_purpose::STANDARD.encode(v)),
        "url-encode" => |v| Some(urlencoding::encode(v).into_owned()),
        "null-if-empty" => |v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        },
        _ => return None,
    };

    TRANSFORM_NAMES
        .iter()
        .find(|n| **n == name)
        .map(|canonical| (*canonical, f))
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut at_word_start = true;
    for c in value.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn fold_accent(c: char) -> Option<char> {
    let folded = match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ý' | 'ÿ' => 'y',
        'Ý' | 'Ÿ' => 'Y',
        _ => return None,
    };
    Some(folded)
}

fn remove_accents(value: &str) -> String {
    value
        .chars()
        // 分解後殘留的組合附加符號
        .filter(|c| !('\u{0300}'..='\u{036F}').contains(c))
        .map(|c| fold_accent(c).unwrap_or(c))
        .collect()
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn format_cpf(value: &str) -> String {
    let n = digits(value);
    if n.len() != 11 {
        return value.to_string();
    }
    format!("{}.{}.{}-{}", &n[..3], &n[3..6], &n[6..9], &n[9..])
}

fn format_cnpj(value: &str) -> String {
    let n = digits(value);
    if n.len() != 14 {
        return value.to_string();
    }
    format!("{}.{}.{}/{}-{}", &n[..2], &n[2..5], &n[5..8], &n[8..12], &n[12..])
}

fn format_phone_br(value: &str) -> String {
    let n = digits(value);
    match n.len() {
        11 => format!("({}) {}-{}", &n[..2], &n[2..7], &n[7..]),
        10 => format!("({}) {}-{}", &n[..2], &n[2..6], &n[6..]),
        _ => value.to_string(),
    }
}

fn format_cep(value: &str) -> String {
    let n = digits(value);
    if n.len() != 8 {
        return value.to_string();
    }
    format!("{}-{}", &n[..5], &n[5..])
}

fn slugify(value: &str) -> String {
    let lowered = remove_accents(value).to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// 把 `yyyy-MM-dd`、`DD/MM/YYYY` 這類樣式轉為 chrono 格式；含 `%` 時視為已是 chrono 格式
pub fn to_chrono_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }

    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("YYYY", "%Y"),
        ("fff", "%3f"),
        ("yy", "%y"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("tt", "%p"),
    ];

    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        // 單引號內為字面文字
        if let Some(stripped) = rest.strip_prefix('\'') {
            match stripped.find('\'') {
                Some(end) => {
                    out.push_str(&stripped[..end]);
                    rest = &stripped[end + 1..];
                }
                None => {
                    out.push_str(stripped);
                    rest = "";
                }
            }
            continue;
        }
        for (token, replacement) in TOKENS {
            if let Some(stripped) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

pub fn is_valid_chrono_pattern(pattern: &str) -> bool {
    !StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
}

/// 嘗試解析常見日期格式
pub fn parse_date_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }

    const DATE_TIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    for format in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%Y%m%d"];
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// 以 chrono 格式輸出；格式無法套用時回傳 `None`
pub fn format_date_time(dt: &NaiveDateTime, pattern: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(pattern)).ok()?;
    Some(out)
}

fn reformat_date(value: &str, pattern: &str) -> String {
    parse_date_time(value)
        .and_then(|dt| format_date_time(&dt, pattern))
        .unwrap_or_else(|| value.to_string())
}

//! 動態值公式，例如 `now()`、`uuid()`、`random(1,10)`
//!
//! 無法辨識的公式（包含參數錯誤）原樣回傳文字。

use crate::core::transforms::{format_date_time, is_valid_chrono_pattern, to_chrono_pattern};
use chrono::{Duration, Local, NaiveDateTime, Utc};
use rand::Rng;

const DATE_TIME_PATTERN: &str = "%Y-%m-%dT%H:%M:%SZ";
const DATE_PATTERN: &str = "%Y-%m-%d";

pub fn evaluate(formula: &str) -> Option<String> {
    let trimmed = formula.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Some((name, param)) = split_call(trimmed) else {
        return Some(formula.to_string());
    };

    let evaluated = evaluate_call(&name, param);

    // 參數錯誤或未知公式時原樣輸出
    evaluated.or_else(|| Some(formula.to_string()))
}

fn evaluate_call(name: &str, param: Option<&str>) -> Option<String> {
    match (name, param) {
        ("now", None) => format_now(Local::now().naive_local(), DATE_TIME_PATTERN),
        ("utcnow", None) => format_now(Utc::now().naive_utc(), DATE_TIME_PATTERN),
        ("today", None) => format_now(today(), DATE_PATTERN),
        ("uuid" | "guid", None) => Some(uuid::Uuid::new_v4().to_string()),
        ("timestamp", None) => Some(Utc::now().timestamp().to_string()),
        ("timestamp_ms", None) => Some(Utc::now().timestamp_millis().to_string()),
        ("now", Some(fmt)) => format_now(Local::now().naive_local(), &chrono_pattern(fmt)?),
        ("utcnow", Some(fmt)) => format_now(Utc::now().naive_utc(), &chrono_pattern(fmt)?),
        ("today", Some(fmt)) => format_now(today(), &chrono_pattern(fmt)?),
        ("adddays", Some(days)) => {
            let days: i64 = days.parse().ok()?;
            let date = today().checked_add_signed(Duration::try_days(days)?)?;
            format_now(date, DATE_PATTERN)
        }
        ("addhours", Some(hours)) => {
            let hours: i64 = hours.parse().ok()?;
            let at = Local::now()
                .naive_local()
                .checked_add_signed(Duration::try_hours(hours)?)?;
            format_now(at, DATE_TIME_PATTERN)
        }
        ("random", Some(range)) => random_between(range),
        _ => None,
    }
}

/// 拆出函式名稱（小寫）與參數（保留大小寫，去除引號）
fn split_call(formula: &str) -> Option<(String, Option<&str>)> {
    let open = formula.find('(')?;
    if !formula.ends_with(')') {
        return None;
    }

    let name = formula[..open].trim().to_lowercase();
    let inner = formula[open + 1..formula.len() - 1].trim();
    let inner = strip_quotes(inner).trim();
    let param = if inner.is_empty() { None } else { Some(inner) };
    Some((name, param))
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn today() -> NaiveDateTime {
    Local::now().date_naive().and_time(chrono::NaiveTime::MIN)
}

fn chrono_pattern(fmt: &str) -> Option<String> {
    let pattern = to_chrono_pattern(fmt);
    is_valid_chrono_pattern(&pattern).then_some(pattern)
}

fn format_now(at: NaiveDateTime, pattern: &str) -> Option<String> {
    format_date_time(&at, pattern)
}

fn random_between(range: &str) -> Option<String> {
    let (min, max) = range.split_once(',')?;
    let min: i64 = min.trim().parse().ok()?;
    let max: i64 = max.trim().parse().ok()?;
    if min > max {
        return None;
    }
    Some(rand::thread_rng().gen_range(min..=max).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_uuid_and_guid() {
        let id = evaluate("uuid()").unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        let id = evaluate("GUID()").unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_now_and_today_shapes() {
        let now = evaluate("utcnow()").unwrap();
        assert!(NaiveDateTime::parse_from_str(&now, DATE_TIME_PATTERN).is_ok());

        let today = evaluate(" today() ").unwrap();
        assert!(NaiveDate::parse_from_str(&today, DATE_PATTERN).is_ok());

        let custom = evaluate("now('dd/MM/yyyy')").unwrap();
        assert!(NaiveDate::parse_from_str(&custom, "%d/%m/%Y").is_ok());
    }

    #[test]
    fn test_timestamps() {
        let seconds: i64 = evaluate("timestamp()").unwrap().parse().unwrap();
        let millis: i64 = evaluate("timestamp_ms()").unwrap().parse().unwrap();
        assert!(millis / 1000 - seconds <= 1);
    }

    #[test]
    fn test_adddays() {
        let expected = (Local::now().date_naive() + Duration::days(3))
            .format(DATE_PATTERN)
            .to_string();
        assert_eq!(evaluate("adddays(3)").unwrap(), expected);
    }

    #[test]
    fn test_random_is_inclusive_range() {
        for _ in 0..50 {
            let value: i64 = evaluate("random(1, 3)").unwrap().parse().unwrap();
            assert!((1..=3).contains(&value));
        }
        assert_eq!(evaluate("random(5,5)").unwrap(), "5");
    }

    #[test]
    fn test_unrecognized_formulas_pass_through() {
        assert_eq!(evaluate("hello world").unwrap(), "hello world");
        assert_eq!(evaluate("sum(1,2)").unwrap(), "sum(1,2)");
        assert_eq!(evaluate("adddays(x)").unwrap(), "adddays(x)");
        assert_eq!(evaluate("random(9,1)").unwrap(), "random(9,1)");
        assert_eq!(evaluate(""), None);
    }
}

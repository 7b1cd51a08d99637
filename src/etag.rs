//! ETag 计算与条件请求判断。

use axum::http::{HeaderMap, header};
use std::fs::Metadata;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

/// 由大小与修改时间生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    if let Some(modified) = metadata.modified().ok()
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{size}\"")
}

/// 写操作的 If-Match / If-None-Match 校验。
pub fn check_preconditions(
    headers: &HeaderMap,
    current_etag: Option<&str>,
    exists: bool,
) -> Result<(), ApiError> {
    let failed = || ApiError::PreconditionFailed("precondition failed".into());

    if let Some(value) = header_str(headers, header::IF_MATCH) {
        let matched = if value.trim() == "*" {
            exists
        } else {
            etag_list_contains(value, current_etag)
        };
        if !matched {
            return Err(failed());
        }
    }

    if let Some(value) = header_str(headers, header::IF_NONE_MATCH) {
        let matched = if value.trim() == "*" {
            exists
        } else {
            etag_list_contains(value, current_etag)
        };
        if matched {
            return Err(failed());
        }
    }

    Ok(())
}

/// 读请求判断是否可以返回 304。If-None-Match 存在时忽略 If-Modified-Since。
pub fn is_not_modified(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(value) = header_str(headers, header::IF_NONE_MATCH) {
        return value.trim() == "*" || etag_list_contains(value, Some(etag));
    }
    if let Some(since) = header_str(headers, header::IF_MODIFIED_SINCE)
        .and_then(|value| httpdate::parse_http_date(value).ok())
        && let Some(modified) = modified
    {
        return truncate_to_secs(modified) <= since;
    }
    false
}

/// If-Range 成立时才允许按 Range 返回部分内容。
pub fn if_range_allows(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    let Some(value) = header_str(headers, header::IF_RANGE) else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return weak_eq(value, etag);
    }
    match (httpdate::parse_http_date(value), modified) {
        (Ok(date), Some(modified)) => truncate_to_secs(modified) <= date,
        _ => false,
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn etag_list_contains(header_value: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return false;
    };
    header_value
        .split(',')
        .map(str::trim)
        .any(|item| weak_eq(item, current))
}

fn weak_eq(left: &str, right: &str) -> bool {
    left.trim_start_matches("W/") == right.trim_start_matches("W/")
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => UNIX_EPOCH + Duration::from_secs(duration.as_secs()),
        Err(_) => time,
    }
}

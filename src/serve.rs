//! 文件读取响应：条件请求、单段与多段 Range、流式输出。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use httpdate::fmt_http_date;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_allows, is_not_modified};
use crate::storage::ResolvedPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Attachment,
    Inline,
}

/// 闭区间字节范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

pub fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 输出普通文件；`head_only` 时只返回头部。
pub async fn serve_file(
    request_headers: &HeaderMap,
    target: &ResolvedPath,
    metadata: &Metadata,
    disposition: Disposition,
    head_only: bool,
) -> Result<Response, ApiError> {
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(metadata);
    let mime = mime_guess::from_path(target.absolute()).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if is_not_modified(request_headers, &etag, modified) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    if disposition == Disposition::Attachment {
        let name = target.file_name().unwrap_or("download");
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            header_value(&attachment_disposition(name))?,
        );
    }

    let ranges = if if_range_allows(request_headers, &etag, modified) {
        parse_ranges(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    match ranges.as_deref() {
        Some([range]) => {
            debug!(path = target.relative(), start = range.start, end = range.end, "single range");
            response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {}-{}/{}", range.start, range.end, file_size))?,
            );
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
            let body = if head_only {
                AxumBody::empty()
            } else {
                AxumBody::from_stream(range_stream(target.absolute().to_path_buf(), *range))
            };
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        Some(ranges) => {
            debug!(path = target.relative(), count = ranges.len(), "multipart ranges");
            let boundary = Uuid::new_v4().simple().to_string();
            let (length, body) = multipart_body(
                target.absolute().to_path_buf(),
                ranges,
                mime.essence_str(),
                file_size,
                &boundary,
            );
            response_headers.insert(
                header::CONTENT_TYPE,
                header_value(&format!("multipart/byteranges; boundary={boundary}"))?,
            );
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            let body = if head_only { AxumBody::empty() } else { body };
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        None => {
            response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
            let body = if head_only {
                AxumBody::empty()
            } else {
                let file = File::open(target.absolute()).await?;
                AxumBody::from_stream(ReaderStream::new(file))
            };
            Ok((StatusCode::OK, response_headers, body).into_response())
        }
    }
}

/// 解析 Range 头。越界的结束位置截断到文件末尾，不可满足的段被丢弃；
/// 全部不可满足时返回 416，语法错误返回 400。
pub fn parse_ranges(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<Vec<ByteRange>>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = || ApiError::BadRequest("invalid Range header".into());
    let value = value.to_str().map_err(|_| invalid())?;
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Err(invalid());
    };

    let mut ranges = Vec::new();
    let mut parsed_any = false;
    for part in spec.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        parsed_any = true;
        let (start_part, end_part) = part.split_once('-').ok_or_else(invalid)?;
        let (start_part, end_part) = (start_part.trim(), end_part.trim());

        if start_part.is_empty() {
            let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
            if suffix == 0 || file_size == 0 {
                continue;
            }
            ranges.push(ByteRange {
                start: file_size.saturating_sub(suffix),
                end: file_size - 1,
            });
            continue;
        }

        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end = if end_part.is_empty() {
            None
        } else {
            Some(end_part.parse::<u64>().map_err(|_| invalid())?)
        };
        if let Some(end) = end
            && end < start
        {
            return Err(invalid());
        }
        if start >= file_size {
            continue;
        }
        let last = file_size - 1;
        ranges.push(ByteRange {
            start,
            end: end.map_or(last, |end| end.min(last)),
        });
    }

    if !parsed_any {
        return Err(invalid());
    }
    if ranges.is_empty() {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some(ranges))
}

pub fn attachment_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii() && !ch.is_ascii_control() && ch != '"' && ch != '\\' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(name, NON_ALPHANUMERIC)
    )
}

fn range_stream(path: PathBuf, range: ByteRange) -> BoxStream<'static, io::Result<Bytes>> {
    stream::once(async move {
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        Ok::<_, io::Error>(ReaderStream::new(file.take(range.len())))
    })
    .try_flatten()
    .boxed()
}

fn multipart_body(
    path: PathBuf,
    ranges: &[ByteRange],
    content_type: &str,
    file_size: u64,
    boundary: &str,
) -> (u64, AxumBody) {
    let mut length = 0u64;
    let mut segments: Vec<BoxStream<'static, io::Result<Bytes>>> = Vec::new();
    for range in ranges {
        let part_header = format!(
            "\r\n--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: bytes {}-{}/{file_size}\r\n\r\n",
            range.start, range.end
        );
        length += part_header.len() as u64 + range.len();
        segments.push(stream::once(async move { Ok(Bytes::from(part_header)) }).boxed());
        segments.push(range_stream(path.clone(), *range));
    }
    let closing = format!("\r\n--{boundary}--\r\n");
    length += closing.len() as u64;
    segments.push(stream::once(async move { Ok(Bytes::from(closing)) }).boxed());

    (length, AxumBody::from_stream(stream::iter(segments).flatten()))
}

#[cfg(test)]
mod tests {
    use super::{ByteRange, attachment_disposition, parse_ranges};
    use crate::error::ApiError;
    use axum::http::HeaderValue;

    fn ranges(value: &str, size: u64) -> Result<Option<Vec<ByteRange>>, ApiError> {
        parse_ranges(Some(&HeaderValue::from_str(value).unwrap()), size)
    }

    #[test]
    fn absent_header_means_full_body() {
        assert!(parse_ranges(None, 10).unwrap().is_none());
    }

    #[test]
    fn parses_open_suffix_and_clamped_ranges() {
        assert_eq!(
            ranges("bytes=2-", 10).unwrap().unwrap(),
            [ByteRange { start: 2, end: 9 }]
        );
        assert_eq!(
            ranges("bytes=-3", 10).unwrap().unwrap(),
            [ByteRange { start: 7, end: 9 }]
        );
        assert_eq!(
            ranges("bytes=5-100", 10).unwrap().unwrap(),
            [ByteRange { start: 5, end: 9 }]
        );
        assert_eq!(
            ranges("bytes=-50", 10).unwrap().unwrap(),
            [ByteRange { start: 0, end: 9 }]
        );
    }

    #[test]
    fn keeps_satisfiable_parts_of_multi_range() {
        assert_eq!(
            ranges("bytes=0-1, 4-5, 20-30", 10).unwrap().unwrap(),
            [ByteRange { start: 0, end: 1 }, ByteRange { start: 4, end: 5 }]
        );
    }

    #[test]
    fn unsatisfiable_and_invalid_ranges() {
        assert!(matches!(
            ranges("bytes=10-20", 10),
            Err(ApiError::RangeNotSatisfiable(10))
        ));
        assert!(matches!(
            ranges("bytes=0-1", 0),
            Err(ApiError::RangeNotSatisfiable(0))
        ));
        assert!(matches!(ranges("bytes=5-2", 10), Err(ApiError::BadRequest(_))));
        assert!(matches!(ranges("items=0-1", 10), Err(ApiError::BadRequest(_))));
        assert!(matches!(ranges("bytes=a-b", 10), Err(ApiError::BadRequest(_))));
        assert!(matches!(ranges("bytes=", 10), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn disposition_encodes_non_ascii_names() {
        assert_eq!(
            attachment_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report%2Epdf"
        );
        let encoded = attachment_disposition("报告 \"v2\".txt");
        assert!(encoded.starts_with("attachment; filename=\"__ _v2_.txt\""));
        assert!(encoded.contains("%E6%8A%A5"));
    }
}

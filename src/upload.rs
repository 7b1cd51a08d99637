//! 上传处理器：multipart 表单与原始请求体写入。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Multipart, Query, multipart::Field};
use axum::http::{HeaderMap, Uri, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::auth::AccessControl;
use crate::error::ApiError;
use crate::etag::{check_preconditions, etag_from_metadata};
use crate::files::{OptionalPathQuery, PathResponse};
use crate::http::route_tail;
use crate::router::API_UPLOAD;
use crate::serve::header_value;
use crate::storage::{ResolvedPath, Storage};

#[derive(Serialize)]
pub struct UploadSummary {
    success: bool,
    files: Vec<String>,
    count: usize,
}

/// multipart 上传。`path` 字段改变其后文件的目标目录；单个文件失败只记录日志。
pub async fn upload_multipart(
    uri: Uri,
    Query(query): Query<OptionalPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadSummary>, ApiError> {
    let tail = route_tail(uri.path(), API_UPLOAD)?;
    let initial = if tail.trim_matches('/').is_empty() {
        query.path.unwrap_or_default()
    } else {
        tail
    };
    let mut directory = Some(access.resolve(&storage, &initial, true).await?);
    let mut saved = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) if saved.is_empty() => {
                return Err(ApiError::BadRequest(format!("invalid multipart body: {err}")));
            }
            Err(err) => {
                warn!(error = %err, saved = saved.len(), "multipart stream ended early");
                break;
            }
        };

        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "path" => {
                let value = match field.text().await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(error = %err, "unreadable path field");
                        directory = None;
                        continue;
                    }
                };
                directory = match access.resolve(&storage, &value, true).await {
                    Ok(resolved) => Some(resolved),
                    Err(err) => {
                        warn!(path = %value, error = ?err, "rejected upload directory");
                        None
                    }
                };
            }
            "files" | "files[]" | "file" => {
                let Some(name) = field.file_name().and_then(base_name) else {
                    warn!("skipping upload part without a usable file name");
                    continue;
                };
                // 上一个 path 字段无效时，直到下一个有效 path 之前的文件都跳过
                let Some(directory) = directory.as_ref() else {
                    warn!(name = %name, "skipping upload part without a valid directory");
                    continue;
                };
                match store_field(&storage, &access, directory, &name, field).await {
                    Ok(()) => {
                        info!(directory = directory.relative(), name = %name, "uploaded file");
                        saved.push(name);
                    }
                    Err(err) => warn!(name = %name, error = ?err, "upload part failed"),
                }
            }
            _ => {}
        }
    }

    Ok(JsonResponse(UploadSummary {
        success: true,
        count: saved.len(),
        files: saved,
    }))
}

/// 以原始请求体写入单个文件，支持 If-Match / If-None-Match。
pub async fn upload_raw(
    uri: Uri,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let requested = route_tail(uri.path(), API_UPLOAD)?;
    let target = access.resolve(&storage, &requested, true).await?;
    let existing = existing_metadata(&target).await?;
    if target.is_root() || existing.as_ref().is_some_and(Metadata::is_dir) {
        return Err(ApiError::BadRequest("target is a directory".into()));
    }
    let metadata = store_body(&headers, &target, existing.as_ref(), body).await?;
    info!(path = target.relative(), size = metadata.len(), "wrote file");
    let mut response = JsonResponse(PathResponse::ok(target.relative())).into_response();
    response.headers_mut().extend(validator_headers(&metadata)?);
    Ok(response)
}

pub async fn existing_metadata(target: &ResolvedPath) -> Result<Option<Metadata>, ApiError> {
    match fs::metadata(target.absolute()).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// 校验前置条件后把请求体原子写入目标文件，缺失的父目录会被创建。
pub async fn store_body(
    headers: &HeaderMap,
    target: &ResolvedPath,
    existing: Option<&Metadata>,
    body: AxumBody,
) -> Result<Metadata, ApiError> {
    let etag = existing.map(etag_from_metadata);
    check_preconditions(headers, etag.as_deref(), existing.is_some())?;
    if let Some(parent) = target.absolute().parent() {
        fs::create_dir_all(parent).await?;
    }
    AtomicFile::create(target.absolute())
        .await?
        .write_stream(body.into_data_stream())
        .await?;
    Ok(fs::metadata(target.absolute()).await?)
}

pub fn validator_headers(metadata: &Metadata) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, header_value(&etag_from_metadata(metadata))?);
    if let Ok(modified) = metadata.modified() {
        headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    Ok(headers)
}

async fn store_field(
    storage: &Storage,
    access: &AccessControl,
    directory: &ResolvedPath,
    name: &str,
    field: Field<'_>,
) -> Result<(), ApiError> {
    let target = directory.join(name);
    access.check_path(&target.acl_path())?;
    storage.ensure_no_symlink_components(&target, true).await?;
    if existing_metadata(&target)
        .await?
        .is_some_and(|metadata| metadata.is_dir())
    {
        return Err(ApiError::BadRequest("target is a directory".into()));
    }
    storage.create_dir(directory).await?;
    AtomicFile::create(target.absolute())
        .await?
        .write_stream(field)
        .await?;
    Ok(())
}

/// 只保留客户端文件名的最后一段。
fn base_name(file_name: &str) -> Option<String> {
    let name = file_name.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name if name.contains('\0') => None,
        name => Some(name.to_string()),
    }
}

/// 上传被禁用时的统一响应。
pub async fn upload_disabled() -> ApiError {
    ApiError::FeatureDisabled("File upload is disabled. Use --upload flag to enable.")
}

#[cfg(test)]
mod tests {
    use super::base_name;

    #[test]
    fn base_name_strips_client_directories() {
        assert_eq!(base_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(base_name("C:\\Users\\me\\report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(base_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(base_name("dir/.."), None);
        assert_eq!(base_name("dir/"), None);
        assert_eq!(base_name("."), None);
    }
}

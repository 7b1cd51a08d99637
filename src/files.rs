//! 目录列表、下载与删除处理器。

use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::AccessControl;
use crate::error::ApiError;
use crate::http::route_tail;
use crate::router::{API_DELETE, API_DOWNLOAD};
use crate::serve::{Disposition, serve_file};
use crate::storage::{FileEntry, Storage};

#[derive(Deserialize)]
pub(crate) struct OptionalPathQuery {
    pub(crate) path: Option<String>,
}

#[derive(Serialize)]
pub struct ListResponse {
    path: String,
    files: Vec<FileEntry>,
}

#[derive(Serialize)]
pub struct PathResponse {
    success: bool,
    path: String,
}

impl PathResponse {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            success: true,
            path: path.into(),
        }
    }
}

/// 列出目录的直接子项，被 ACL 拒绝的子项不出现在结果里。
pub async fn list_files(
    Query(query): Query<OptionalPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
) -> Result<JsonResponse<ListResponse>, ApiError> {
    let requested = query.path.as_deref().unwrap_or("/");
    let target = access.resolve(&storage, requested, false).await?;
    if !storage.metadata(&target).await?.is_dir() {
        return Err(ApiError::BadRequest("path is not a directory".into()));
    }
    let files: Vec<FileEntry> = storage
        .list_dir(&target)
        .await?
        .into_iter()
        .filter(|entry| access.is_allowed(&format!("/{}", entry.path)))
        .collect();
    info!(path = target.relative(), count = files.len(), "list files");
    Ok(JsonResponse(ListResponse {
        path: target.acl_path(),
        files,
    }))
}

pub async fn download_file(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
) -> Result<Response, ApiError> {
    let requested = route_tail(uri.path(), API_DOWNLOAD)?;
    let target = access.resolve(&storage, &requested, false).await?;
    let metadata = storage.metadata(&target).await?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("cannot download a directory".into()));
    }
    info!(path = target.relative(), size = metadata.len(), "download file");
    serve_file(
        &headers,
        &target,
        &metadata,
        Disposition::Attachment,
        method == Method::HEAD,
    )
    .await
}

/// 删除文件或递归删除目录；根目录不可删除。
pub async fn delete_entry(
    uri: Uri,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    let requested = route_tail(uri.path(), API_DELETE)?;
    let target = storage.resolve(&requested)?;
    if target.is_root() {
        return Err(ApiError::BadRequest("cannot delete the root directory".into()));
    }
    let target = access.resolve(&storage, &requested, false).await?;
    storage.delete(&target).await?;
    info!(path = target.relative(), "delete entry");
    Ok(JsonResponse(PathResponse::ok(target.relative())))
}

pub async fn delete_disabled() -> ApiError {
    ApiError::FeatureDisabled("File delete is disabled. Use --delete flag to enable.")
}

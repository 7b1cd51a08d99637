//! `/webdav` 挂载点：把 WebDAV 方法映射到与 REST 接口相同的存储操作。

use async_walkdir::WalkDir;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::atomic::is_staging_name;
use crate::auth::AccessControl;
use crate::error::ApiError;
use crate::etag::etag_from_metadata;
use crate::http::{is_under, route_tail};
use crate::multistatus::{self, DavResource};
use crate::router::WEBDAV_MOUNT;
use crate::serve::{Disposition, serve_file};
use crate::storage::{FileEntry, ResolvedPath, Storage};
use crate::upload::{existing_metadata, store_body, validator_headers};

const ALLOWED_METHODS: &str = "OPTIONS, GET, HEAD, PUT, DELETE, MKCOL, PROPFIND, MOVE, COPY";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Depth {
    Zero,
    One,
    Infinity,
}

pub async fn webdav_handler(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let requested = route_tail(parts.uri.path(), WEBDAV_MOUNT)?;
    debug!(method = %parts.method, path = %requested, "webdav request");

    match parts.method.as_str() {
        "OPTIONS" => Ok(options_response()),
        "GET" | "HEAD" => {
            let target = access.resolve(&storage, &requested, false).await?;
            let metadata = storage.metadata(&target).await?;
            if metadata.is_dir() {
                return Err(ApiError::BadRequest("cannot GET a collection".into()));
            }
            serve_file(
                &parts.headers,
                &target,
                &metadata,
                Disposition::Inline,
                parts.method == Method::HEAD,
            )
            .await
        }
        "PUT" => put(&storage, &access, &requested, &parts.headers, body).await,
        "DELETE" => delete(&storage, &access, &requested).await,
        "MKCOL" => mkcol(&storage, &access, &requested, &parts.headers).await,
        "PROPFIND" => propfind(&storage, &access, &requested, &parts.headers).await,
        "MOVE" => transfer(&storage, &access, &requested, &parts.headers, Transfer::Move).await,
        "COPY" => transfer(&storage, &access, &requested, &parts.headers, Transfer::Copy).await,
        other => Err(ApiError::MethodNotAllowed(format!("method {other} not allowed"))),
    }
}

/// WebDAV 被禁用时的统一响应。
pub async fn webdav_disabled() -> ApiError {
    ApiError::FeatureDisabled("WebDAV is disabled. Use --webdav to enable.")
}

fn options_response() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("dav", HeaderValue::from_static("1"));
    headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert("ms-author-via", HeaderValue::from_static("DAV"));
    (StatusCode::OK, headers).into_response()
}

async fn put(
    storage: &Storage,
    access: &AccessControl,
    requested: &str,
    headers: &HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let target = access.resolve(storage, requested, true).await?;
    let existing = existing_metadata(&target).await?;
    if target.is_root() || existing.as_ref().is_some_and(Metadata::is_dir) {
        return Err(ApiError::MethodNotAllowed("cannot PUT to a collection".into()));
    }
    let metadata = store_body(headers, &target, existing.as_ref(), body).await?;
    info!(path = target.relative(), size = metadata.len(), "webdav put");
    Ok((StatusCode::CREATED, validator_headers(&metadata)?).into_response())
}

async fn delete(
    storage: &Storage,
    access: &AccessControl,
    requested: &str,
) -> Result<Response, ApiError> {
    let target = storage.resolve(requested)?;
    if target.is_root() {
        return Err(ApiError::Forbidden("cannot delete the root collection".into()));
    }
    let target = access.resolve(storage, requested, false).await?;
    storage.delete(&target).await?;
    info!(path = target.relative(), "webdav delete");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mkcol(
    storage: &Storage,
    access: &AccessControl,
    requested: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let has_body = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() != "0")
        || headers.contains_key(header::TRANSFER_ENCODING);
    if has_body {
        return Err(ApiError::UnsupportedMediaType(
            "MKCOL request bodies are not supported".into(),
        ));
    }
    let target = access.resolve(storage, requested, true).await?;
    if existing_metadata(&target).await?.is_some() {
        return Err(ApiError::MethodNotAllowed("resource already exists".into()));
    }
    let parent_exists = match target.absolute().parent() {
        Some(parent) => fs::metadata(parent).await.is_ok_and(|meta| meta.is_dir()),
        None => false,
    };
    if !parent_exists {
        return Err(ApiError::Conflict("parent collection does not exist".into()));
    }
    fs::create_dir(target.absolute()).await?;
    info!(path = target.relative(), "webdav mkcol");
    Ok(StatusCode::CREATED.into_response())
}

async fn propfind(
    storage: &Storage,
    access: &AccessControl,
    requested: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let depth = parse_depth(headers)?;
    let target = access.resolve(storage, requested, false).await?;
    let root_entry = storage.entry(&target).await?;

    let mut entries = Vec::new();
    if root_entry.is_dir {
        match depth {
            Depth::Zero => {}
            Depth::One => entries.extend(
                storage
                    .list_dir(&target)
                    .await?
                    .into_iter()
                    .filter(|entry| access.is_allowed(&format!("/{}", entry.path))),
            ),
            Depth::Infinity => entries.extend(descendants(storage, access, &target).await?),
        }
    }

    let mut resources = Vec::with_capacity(entries.len() + 1);
    resources.push(dav_resource(storage, &root_entry).await);
    for entry in &entries {
        resources.push(dav_resource(storage, entry).await);
    }

    let body = multistatus::render(&resources)
        .map_err(|err| ApiError::Internal(format!("multistatus render failed: {err}")))?;
    Ok((
        StatusCode::MULTI_STATUS,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml; charset=utf-8"),
        )],
        body,
    )
        .into_response())
}

fn parse_depth(headers: &HeaderMap) -> Result<Depth, ApiError> {
    let Some(value) = headers.get("depth") else {
        return Ok(Depth::One);
    };
    match value.to_str().map(str::trim) {
        Ok("0") => Ok(Depth::Zero),
        Ok("1") => Ok(Depth::One),
        Ok(value) if value.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
        _ => Err(ApiError::BadRequest("invalid Depth header".into())),
    }
}

async fn dav_resource(storage: &Storage, entry: &FileEntry) -> DavResource {
    let etag = if entry.is_dir {
        None
    } else {
        match storage.resolve(&entry.path) {
            Ok(target) => storage
                .metadata(&target)
                .await
                .ok()
                .map(|metadata| etag_from_metadata(&metadata)),
            Err(_) => None,
        }
    };
    DavResource::from_entry(WEBDAV_MOUNT, entry, etag)
}

async fn descendants(
    storage: &Storage,
    access: &AccessControl,
    target: &ResolvedPath,
) -> Result<Vec<FileEntry>, ApiError> {
    let mut entries = Vec::new();
    let mut walk = WalkDir::new(target.absolute());
    while let Some(entry) = walk.next().await {
        let entry = entry.map_err(|err| ApiError::Internal(err.to_string()))?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).await?;
        if metadata.file_type().is_symlink() {
            continue;
        }
        let (Some(relative), Some(name)) = (
            storage.relative_of(&path),
            entry.file_name().to_str().map(str::to_string),
        ) else {
            continue;
        };
        if is_staging_name(&name) || !access.is_allowed(&format!("/{relative}")) {
            continue;
        }
        entries.push(FileEntry::from_metadata(name, relative, &metadata));
    }
    Ok(entries)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transfer {
    Move,
    Copy,
}

async fn transfer(
    storage: &Storage,
    access: &AccessControl,
    requested: &str,
    headers: &HeaderMap,
    kind: Transfer,
) -> Result<Response, ApiError> {
    let source = access.resolve(storage, requested, false).await?;
    if source.is_root() {
        return Err(ApiError::Forbidden("cannot move or copy the root collection".into()));
    }
    let source_metadata = fs::symlink_metadata(source.absolute()).await?;

    let destination = destination_path(headers)?;
    let destination = access.resolve(storage, &destination, true).await?;
    // 目标是源的祖先时，覆盖删除会连同源一起删掉
    if destination.is_within(&source) || source.is_within(&destination) {
        return Err(ApiError::Forbidden("destination overlaps the source".into()));
    }

    let overwrite = headers
        .get("overwrite")
        .and_then(|value| value.to_str().ok())
        .is_none_or(|value| !value.trim().eq_ignore_ascii_case("F"));
    let existing = fs::symlink_metadata(destination.absolute()).await.ok();
    if existing.is_some() && !overwrite {
        return Err(ApiError::PreconditionFailed("destination exists".into()));
    }
    if existing.is_some() {
        storage.delete(&destination).await?;
    }
    if let Some(parent) = destination.absolute().parent() {
        fs::create_dir_all(parent).await?;
    }

    match kind {
        Transfer::Move => fs::rename(source.absolute(), destination.absolute()).await?,
        Transfer::Copy if source_metadata.is_dir() => {
            copy_tree(source.absolute(), destination.absolute()).await?
        }
        Transfer::Copy => {
            fs::copy(source.absolute(), destination.absolute()).await?;
        }
    }
    info!(
        from = source.relative(),
        to = destination.relative(),
        kind = ?kind,
        "webdav transfer"
    );
    Ok(StatusCode::CREATED.into_response())
}

/// 解析 Destination 头，只接受指向本挂载点的地址。
fn destination_path(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get("destination")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Destination header".into()))?;
    let uri: Uri = value
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid Destination header".into()))?;
    if !is_under(uri.path(), WEBDAV_MOUNT) {
        return Err(ApiError::BadRequest(
            "destination is outside the webdav mount".into(),
        ));
    }
    route_tail(uri.path(), WEBDAV_MOUNT)
}

async fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination).await?;
    let mut walk = WalkDir::new(source);
    while let Some(entry) = walk.next().await {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(source) else {
            continue;
        };
        if entry.file_name().to_str().is_some_and(is_staging_name) {
            continue;
        }
        let metadata = fs::symlink_metadata(&path).await?;
        let target = destination.join(relative);
        if metadata.is_dir() {
            fs::create_dir_all(&target).await?;
        } else if metadata.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&path, &target).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Depth, destination_path, parse_depth};
    use axum::http::{HeaderMap, HeaderValue};

    fn with(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn depth_defaults_to_one() {
        assert_eq!(parse_depth(&HeaderMap::new()).unwrap(), Depth::One);
        assert_eq!(parse_depth(&with("depth", "0")).unwrap(), Depth::Zero);
        assert_eq!(
            parse_depth(&with("depth", "Infinity")).unwrap(),
            Depth::Infinity
        );
        assert!(parse_depth(&with("depth", "2")).is_err());
    }

    #[test]
    fn destination_must_target_mount() {
        assert_eq!(
            destination_path(&with("destination", "http://host/webdav/a%20b/c.txt")).unwrap(),
            "/a b/c.txt"
        );
        assert_eq!(
            destination_path(&with("destination", "/webdav/x")).unwrap(),
            "/x"
        );
        assert!(destination_path(&with("destination", "http://host/other/x")).is_err());
        assert!(destination_path(&HeaderMap::new()).is_err());
    }
}

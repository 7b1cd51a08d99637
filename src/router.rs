//! 路由表：受保护的 API 与 WebDAV 挂载、开放路由以及全局中间件。

use axum::extract::{DefaultBodyLimit, Extension, Query, connect_info::ConnectInfo};
use axum::http::{Request, Uri};
use axum::routing::{any, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::GatewayContext;
use crate::error::ApiError;
use crate::files::OptionalPathQuery;
use crate::http::{is_under, resolve_client_ip, route_tail};
use crate::storage::normalize;
use crate::{archive, auth, files, frontend, http, search, upload, version, webdav};

pub const API_LIST: &str = "/api/list";
pub const API_FILES: &str = "/api/files";
pub const API_SEARCH: &str = "/api/search";
pub const API_DOWNLOAD: &str = "/api/download";
pub const API_ZIP: &str = "/api/zip";
pub const API_UPLOAD: &str = "/api/upload";
pub const API_DELETE: &str = "/api/delete";
pub const API_VERSION: &str = "/api/version";
pub const WEBDAV_MOUNT: &str = "/webdav";

/// 推导请求的目标路径（以 `/` 开头的规范化形式），供访问中间件做 ACL 判断。
pub fn request_target(uri: &Uri) -> Result<String, ApiError> {
    let path = uri.path();
    let raw = if let Some(prefix) = [API_DOWNLOAD, API_ZIP, API_DELETE, WEBDAV_MOUNT]
        .into_iter()
        .find(|prefix| is_under(path, prefix))
    {
        route_tail(path, prefix)?
    } else if is_under(path, API_UPLOAD) {
        let tail = route_tail(path, API_UPLOAD)?;
        if tail.trim_matches('/').is_empty() {
            query_path(uri)?
        } else {
            tail
        }
    } else if [API_LIST, API_FILES, API_SEARCH]
        .into_iter()
        .any(|prefix| path == prefix)
    {
        query_path(uri)?
    } else {
        String::new()
    };
    Ok(format!("/{}", normalize(&raw)?))
}

fn query_path(uri: &Uri) -> Result<String, ApiError> {
    let Query(query) = Query::<OptionalPathQuery>::try_from_uri(uri)
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    Ok(query.path.unwrap_or_default())
}

pub fn build_router(ctx: &GatewayContext) -> Router {
    let features = ctx.features;

    let mut protected = Router::new()
        .route(API_LIST, get(files::list_files))
        .route(API_FILES, get(files::list_files))
        .route(API_SEARCH, get(search::search_files))
        .route(API_DOWNLOAD, get(files::download_file))
        .route(&format!("{API_DOWNLOAD}/{{*path}}"), get(files::download_file))
        .route(API_ZIP, get(archive::download_zip))
        .route(&format!("{API_ZIP}/{{*path}}"), get(archive::download_zip));
    let mut open = Router::new().route(API_VERSION, get(version::get_version_info));

    if features.upload {
        let upload_route = post(upload::upload_multipart)
            .put(upload::upload_raw)
            .layer(DefaultBodyLimit::disable());
        protected = protected
            .route(API_UPLOAD, upload_route.clone())
            .route(&format!("{API_UPLOAD}/{{*path}}"), upload_route);
    } else {
        open = open
            .route(API_UPLOAD, any(upload::upload_disabled))
            .route(&format!("{API_UPLOAD}/{{*path}}"), any(upload::upload_disabled));
    }

    if features.delete {
        protected = protected.route(
            &format!("{API_DELETE}/{{*path}}"),
            post(files::delete_entry).delete(files::delete_entry),
        );
    } else {
        open = open
            .route(API_DELETE, any(files::delete_disabled))
            .route(&format!("{API_DELETE}/{{*path}}"), any(files::delete_disabled));
    }

    if features.webdav {
        protected = protected
            .route(WEBDAV_MOUNT, any(webdav::webdav_handler))
            .route(&format!("{WEBDAV_MOUNT}/"), any(webdav::webdav_handler))
            .route(&format!("{WEBDAV_MOUNT}/{{*path}}"), any(webdav::webdav_handler))
            .layer(DefaultBodyLimit::disable());
    } else {
        open = open
            .route(WEBDAV_MOUNT, any(webdav::webdav_disabled))
            .route(&format!("{WEBDAV_MOUNT}/"), any(webdav::webdav_disabled))
            .route(&format!("{WEBDAV_MOUNT}/{{*path}}"), any(webdav::webdav_disabled));
    }

    let protected = protected.route_layer(middleware::from_fn(auth::access_middleware));
    let mut app = protected.merge(open);
    app = match &ctx.frontend {
        Some(assets) => app
            .fallback(frontend::serve_frontend)
            .layer(Extension(assets.clone())),
        None => app.fallback(|| async { ApiError::NotFound("not found".into()) }),
    };

    app.layer(middleware::from_fn(http::add_gateway_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(ctx.storage.clone()))
        .layer(Extension(ctx.access.clone()))
        .layer(Extension(features))
}

//! 版本与功能开关信息。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::config::Features;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    upload: bool,
    delete: bool,
    webdav: bool,
}

/// 不需要认证，前端据此决定显示哪些操作。
pub async fn get_version_info(Extension(features): Extension<Features>) -> JsonResponse<VersionInfo> {
    JsonResponse(VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        upload: features.upload,
        delete: features.delete,
        webdav: features.webdav,
    })
}

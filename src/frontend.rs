//! 静态前端目录服务与 SPA 回退。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Request, header};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::http::is_under;
use crate::serve::header_value;
use crate::storage::{ResolvedPath, Storage};

const INDEX_FILE: &str = "index.html";

/// 前端资源目录，复用根目录同样的路径解析规则。
#[derive(Debug)]
pub struct Frontend {
    assets: Storage,
    base_url: Option<String>,
}

impl Frontend {
    pub async fn open(dir: &Path, base_url: Option<String>) -> io::Result<Self> {
        Ok(Self {
            assets: Storage::open(dir).await?,
            base_url,
        })
    }
}

/// 未匹配路由的回退处理器。
pub async fn serve_frontend(
    Extension(frontend): Extension<Arc<Frontend>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if is_under(path, "/api") {
        return Err(ApiError::NotFound("not found".into()));
    }
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| ApiError::BadRequest("invalid path encoding".into()))?;
    let requested = decoded.trim_start_matches('/');
    let requested = if requested.is_empty() {
        INDEX_FILE
    } else {
        requested
    };

    let target = frontend.assets.resolve_checked(requested, true).await?;
    if target.relative() == INDEX_FILE && fs::metadata(target.absolute()).await.is_ok() {
        return serve_index(&frontend).await;
    }
    if let Some(response) = load_asset(&target).await? {
        return Ok(response);
    }
    if !requested.contains('.') || path.ends_with('/') {
        return serve_index(&frontend).await;
    }
    Err(ApiError::NotFound("not found".into()))
}

async fn load_asset(target: &ResolvedPath) -> Result<Option<Response>, ApiError> {
    match fs::metadata(target.absolute()).await {
        Ok(metadata) if metadata.is_file() => {
            let file = fs::File::open(target.absolute()).await?;
            let mime = mime_guess::from_path(target.absolute()).first_or_octet_stream();
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
            headers.insert(header::CONTENT_LENGTH, metadata.len().into());
            Ok(Some(
                (headers, AxumBody::from_stream(ReaderStream::new(file))).into_response(),
            ))
        }
        _ => Ok(None),
    }
}

async fn serve_index(frontend: &Frontend) -> Result<Response, ApiError> {
    let index = frontend.assets.resolve(INDEX_FILE)?;
    let html = match fs::read_to_string(index.absolute()).await {
        Ok(html) => html,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("not found".into()));
        }
        Err(err) => return Err(err.into()),
    };
    let html = match &frontend.base_url {
        Some(base_url) => inject_config(&html, base_url),
        None => html,
    };
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}

/// 在 `</head>` 前插入运行时配置脚本；没有 head 时依次尝试 `<body>` 与文件开头。
pub fn inject_config(html: &str, base_url: &str) -> String {
    let literal = serde_json::to_string(base_url)
        .unwrap_or_else(|_| "\"\"".into())
        .replace("</", "<\\/");
    let script = format!("<script>window.__AXO_GATE_CONFIG__={{baseURL:{literal}}};</script>");
    if let Some(index) = html.find("</head>") {
        let mut output = String::with_capacity(html.len() + script.len());
        output.push_str(&html[..index]);
        output.push_str(&script);
        output.push_str(&html[index..]);
        return output;
    }
    if let Some(index) = html.find("<body>") {
        let split = index + "<body>".len();
        return format!("{}{script}{}", &html[..split], &html[split..]);
    }
    format!("{script}{html}")
}

#[cfg(test)]
mod tests {
    use super::inject_config;

    #[test]
    fn injects_before_head_close() {
        let html = "<html><head><title>x</title></head><body></body></html>";
        let output = inject_config(html, "https://files.example.com/");
        assert_eq!(
            output,
            "<html><head><title>x</title><script>window.__AXO_GATE_CONFIG__={baseURL:\"https://files.example.com/\"};</script></head><body></body></html>"
        );
    }

    #[test]
    fn falls_back_to_body_then_prefix() {
        let output = inject_config("<body><p>hi</p></body>", "/base");
        assert!(output.starts_with("<body><script>"));
        assert!(output.ends_with("<p>hi</p></body>"));

        let output = inject_config("<p>bare</p>", "/base");
        assert!(output.starts_with("<script>"));
        assert!(output.ends_with("<p>bare</p>"));
    }

    #[test]
    fn base_url_is_quoted_safely() {
        let output = inject_config("", "\"</script>");
        assert!(output.contains(r#"baseURL:"\"<\/script>""#));
        assert_eq!(output.matches("</script>").count(), 1);
    }
}

//! 访问控制：路径 ACL 与可选的 Basic 认证。

use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{body::Body as AxumBody, middleware, response::Response};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use std::sync::Arc;
use tracing::debug;

use crate::acl::PathAcl;
use crate::error::ApiError;
use crate::router::request_target;
use crate::storage::{ResolvedPath, Storage};

const BASIC_CHALLENGE: &str = r#"Basic realm="Restricted""#;

#[derive(Clone, Debug)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    /// 解析 `user:pass`，只在第一个冒号处分割。
    pub fn parse(value: &str) -> Option<Self> {
        let (username, password) = value.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn matches(&self, username: &str, password: &str) -> bool {
        // 两项都比较完再合并结果
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    acl: PathAcl,
    credential: Option<Credential>,
}

impl AccessControl {
    pub fn new(acl: PathAcl, credential: Option<Credential>) -> Self {
        Self { acl, credential }
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.acl.is_allowed(path)
    }

    pub fn check_path(&self, path: &str) -> Result<(), ApiError> {
        if self.acl.is_allowed(path) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("access denied".into()))
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(credential) = &self.credential else {
            return Ok(());
        };
        if let Some(basic) = headers.typed_get::<Authorization<Basic>>()
            && credential.matches(basic.username(), basic.password())
        {
            return Ok(());
        }
        let mut challenge = HeaderMap::new();
        challenge.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(BASIC_CHALLENGE),
        );
        Err(ApiError::Unauthorized(challenge))
    }

    /// 先检查 ACL，再检查认证。
    pub fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<(), ApiError> {
        self.check_path(path)?;
        self.authenticate(headers)
    }

    /// 解析请求路径并在访问文件系统前执行 ACL 检查。
    pub async fn resolve(
        &self,
        storage: &Storage,
        requested: &str,
        allow_missing_leaf: bool,
    ) -> Result<ResolvedPath, ApiError> {
        let target = storage.resolve(requested)?;
        self.check_path(&target.acl_path())?;
        storage
            .ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }
}

/// 受保护路由的中间件：推导目标路径后依次执行 ACL 与认证。
pub async fn access_middleware(
    Extension(access): Extension<Arc<AccessControl>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let target = request_target(req.uri())?;
    if let Err(err) = access.authorize(&target, req.headers()) {
        debug!(method = %req.method(), target = %target, "request rejected");
        return Err(err);
    }
    Ok(next.run(req).await)
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let mut diff = left.len() ^ right.len();
    for (index, byte) in left.iter().enumerate() {
        let other = right.get(index).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::{AccessControl, Credential, constant_time_eq};
    use crate::acl::PathAcl;
    use crate::error::ApiError;
    use axum::http::{HeaderMap, HeaderValue, header};

    fn basic(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).expect("header value"),
        );
        headers
    }

    #[test]
    fn credential_splits_on_first_colon() {
        let credential = Credential::parse("bob:se:cret").expect("credential");
        assert!(credential.matches("bob", "se:cret"));
        assert!(Credential::parse("no-colon").is_none());
        assert!(Credential::parse(":").is_some());
    }

    #[test]
    fn constant_time_eq_compares_lengths() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn missing_credentials_challenge() {
        let access = AccessControl::new(PathAcl::default(), Credential::parse("bob:secret"));
        match access.authenticate(&HeaderMap::new()) {
            Err(ApiError::Unauthorized(headers)) => {
                assert_eq!(
                    headers.get(header::WWW_AUTHENTICATE).unwrap(),
                    r#"Basic realm="Restricted""#
                );
            }
            other => panic!("expected challenge, got {other:?}"),
        }
        // bob:wrong / bob:secret
        assert!(access.authenticate(&basic("Basic Ym9iOndyb25n")).is_err());
        assert!(access.authenticate(&basic("Basic !!!notbase64")).is_err());
        assert!(access.authenticate(&basic("Basic Ym9iOnNlY3JldA==")).is_ok());
    }

    #[test]
    fn acl_checked_before_authentication() {
        let access = AccessControl::new(
            PathAcl::new(Vec::new(), vec!["/private".into()]),
            Credential::parse("bob:secret"),
        );
        assert!(matches!(
            access.authorize("/private/x", &HeaderMap::new()),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            access.authorize("/public/x", &HeaderMap::new()),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn no_credential_means_open_access() {
        let access = AccessControl::default();
        assert!(access.authorize("/anything", &HeaderMap::new()).is_ok());
    }
}

//! TLS 证书加载；未提供证书时生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::config::Args;

pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<RustlsConfig> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            info!(cert = %cert.display(), "loading tls certificate");
            RustlsConfig::from_pem_file(cert, key).await
        }
        (None, None) => self_signed(host).await,
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "--cert and --key must be given together",
        )),
    }
}

/// 证书覆盖绑定地址与 localhost，只保存在内存中。
async fn self_signed(host: IpAddr) -> io::Result<RustlsConfig> {
    let mut names = vec!["localhost".to_string(), host.to_string()];
    if host.is_unspecified() {
        names.push("127.0.0.1".to_string());
    }
    let cert = generate_simple_self_signed(names).map_err(io::Error::other)?;
    warn!("no certificate configured, using a generated self-signed certificate");
    RustlsConfig::from_pem(
        cert.cert.pem().into_bytes(),
        cert.key_pair.serialize_pem().into_bytes(),
    )
    .await
}

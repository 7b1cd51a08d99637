//! CLI arguments, feature switches and the shared gateway context.

use clap::Parser;
use shadow_rs::formatcp;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::acl::{PathAcl, parse_pattern_list};
use crate::auth::{AccessControl, Credential};
use crate::build;
use crate::frontend::Frontend;
use crate::storage::Storage;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
pub const IDLE_TIMEOUT_SECS: u64 = 300;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
pub const ZIP_PIPE_CAPACITY: usize = 64 * 1024;

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug)]
#[command(name = "axo-gate", version = VERSION_INFO, about = "Access-controlled file gateway")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "ROOT_DIR",
        default_value = ".",
        help = "Directory to serve"
    )]
    pub root: PathBuf,
    #[arg(
        short = 'b',
        long = "bind",
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "AXO_HTTPS", help = "Also serve HTTPS")]
    pub https: bool,
    #[arg(long, env = "AXO_HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT, help = "HTTPS port")]
    pub https_port: u16,
    #[arg(
        long = "cert",
        env = "AXO_TLS_CERT",
        help = "TLS certificate (PEM); self-signed when omitted"
    )]
    pub tls_cert: Option<PathBuf>,
    #[arg(long = "key", env = "AXO_TLS_KEY", help = "TLS private key (PEM)")]
    pub tls_key: Option<PathBuf>,
    #[arg(long, env = "AUTH", help = "Basic auth credential as user:pass")]
    pub auth: Option<String>,
    #[arg(long, env = "AXO_ALLOW_PATHS", help = "Comma separated allow patterns")]
    pub allow_paths: Option<String>,
    #[arg(long, env = "AXO_DENY_PATHS", help = "Comma separated deny patterns")]
    pub deny_paths: Option<String>,
    #[arg(
        long,
        env = "AXO_WEBDAV",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Mount WebDAV at /webdav"
    )]
    pub webdav: bool,
    #[arg(long, env = "AXO_UPLOAD", help = "Enable uploads")]
    pub upload: bool,
    #[arg(long, env = "AXO_DELETE", help = "Enable deletes")]
    pub delete: bool,
    #[arg(long, env = "AXO_WEB_DIR", help = "Directory with frontend assets")]
    pub web_dir: Option<PathBuf>,
    #[arg(long, env = "BASE_URL", help = "Base URL injected into the frontend")]
    pub base_url: Option<String>,
}

/// Optional capabilities toggled from the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    pub upload: bool,
    pub delete: bool,
    pub webdav: bool,
}

/// Everything the router needs, built once at startup.
#[derive(Clone, Debug)]
pub struct GatewayContext {
    pub storage: Arc<Storage>,
    pub access: Arc<AccessControl>,
    pub features: Features,
    pub frontend: Option<Arc<Frontend>>,
}

impl GatewayContext {
    pub async fn from_args(args: &Args) -> io::Result<Self> {
        let storage = Storage::open(&args.root).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("invalid root {}: {err}", args.root.display()),
            )
        })?;

        let credential = match args.auth.as_deref() {
            Some(value) => Some(Credential::parse(value).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "--auth must be formatted as user:pass",
                )
            })?),
            None => None,
        };
        let acl = PathAcl::new(
            parse_pattern_list(args.allow_paths.as_deref()),
            parse_pattern_list(args.deny_paths.as_deref()),
        );

        let frontend = match &args.web_dir {
            Some(dir) => Some(Arc::new(
                Frontend::open(dir, args.base_url.clone()).await?,
            )),
            None => None,
        };

        Ok(Self {
            storage: Arc::new(storage),
            access: Arc::new(AccessControl::new(acl, credential)),
            features: Features {
                upload: args.upload,
                delete: args.delete,
                webdav: args.webdav,
            },
            frontend,
        })
    }
}

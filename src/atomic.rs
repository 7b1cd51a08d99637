//! 先写临时文件再改名替换，读者只会看到旧内容或完整的新内容。

use axum::body::Bytes;
use futures_util::{Stream, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::ApiError;

const STAGING_MARKER: &str = ".tmp.";

/// 写入中的临时文件名：`.{name}.tmp.{uuid}`。
pub fn staging_name(base: &str) -> String {
    format!(".{base}{STAGING_MARKER}{}", Uuid::new_v4())
}

/// 列表、搜索、打包与 PROPFIND 都不展示写入中的临时文件。
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.')
        && name
            .rsplit_once(STAGING_MARKER)
            .is_some_and(|(_, suffix)| Uuid::try_parse(suffix).is_ok())
}

pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标同目录创建 `.{name}.tmp.{uuid}` 临时文件。
    pub async fn create(target: &Path) -> Result<Self, ApiError> {
        let parent = target
            .parent()
            .ok_or_else(|| ApiError::BadRequest("invalid target path".into()))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(staging_name(&base));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 写入整个字节流后提交；任一环节失败都会删除临时文件。
    pub async fn write_stream<S, E>(mut self, stream: S) -> Result<u64, ApiError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut written = 0u64;
        loop {
            let chunk = match stream.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    self.discard().await;
                    return Err(ApiError::BadRequest(format!("body read failed: {err}")));
                }
            };
            if let Err(err) = self.file.write_all(&chunk).await {
                self.discard().await;
                return Err(err.into());
            }
            written += chunk.len() as u64;
        }
        self.commit().await?;
        Ok(written)
    }

    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// fsync 后改名覆盖目标。
    pub async fn commit(self) -> Result<(), ApiError> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(ApiError::Internal(err.to_string()));
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(path)?.sync_all())
        .await
        .map_err(io::Error::other)?
}

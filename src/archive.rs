//! 目录或单个文件的流式 zip 打包。

use async_walkdir::WalkDir;
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWrite;
use tokio_util::compat::FuturesAsyncWriteCompatExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::atomic::is_staging_name;
use crate::auth::AccessControl;
use crate::config::ZIP_PIPE_CAPACITY;
use crate::error::ApiError;
use crate::http::route_tail;
use crate::router::API_ZIP;
use crate::serve::{attachment_disposition, header_value};
use crate::storage::{ResolvedPath, Storage};

pub async fn download_zip(
    uri: Uri,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
) -> Result<Response, ApiError> {
    let requested = route_tail(uri.path(), API_ZIP)?;
    let target = access.resolve(&storage, &requested, false).await?;
    let is_dir = storage.metadata(&target).await?.is_dir();
    let archive_name = format!("{}.zip", target.file_name().unwrap_or("archive"));

    let (mut writer, reader) = tokio::io::duplex(ZIP_PIPE_CAPACITY);
    let task_storage = storage.clone();
    let task_target = target.clone();
    tokio::spawn(async move {
        let result = write_archive(&mut writer, &task_storage, &task_target, is_dir, &access).await;
        if let Err(err) = result {
            warn!(path = task_target.relative(), error = %err, "zip stream aborted");
        }
    });

    info!(path = target.relative(), archive = %archive_name, "zip download");
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&attachment_disposition(&archive_name))?,
    );
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// 写出 zip 内容，条目名相对根目录。目录会写成以 `/` 结尾的显式条目，
/// 符号链接与被 ACL 拒绝的条目会被跳过。
pub async fn write_archive<W>(
    writer: &mut W,
    storage: &Storage,
    target: &ResolvedPath,
    is_dir: bool,
    access: &AccessControl,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut zip = ZipFileWriter::with_tokio(writer);

    if !is_dir {
        add_file(&mut zip, target.absolute(), target.relative()).await?;
        zip.close().await.map_err(io::Error::other)?;
        return Ok(());
    }

    if !target.is_root() {
        add_directory(&mut zip, target.relative()).await?;
    }
    let mut walk = WalkDir::new(target.absolute());
    while let Some(entry) = walk.next().await {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).await?;
        if metadata.file_type().is_symlink()
            || entry.file_name().to_str().is_some_and(is_staging_name)
        {
            continue;
        }
        let Some(relative) = storage.relative_of(&path) else {
            continue;
        };
        if !access.is_allowed(&format!("/{relative}")) {
            continue;
        }
        if metadata.is_dir() {
            add_directory(&mut zip, &relative).await?;
        } else if metadata.is_file() {
            add_file(&mut zip, &path, &relative).await?;
        }
    }

    zip.close().await.map_err(io::Error::other)?;
    Ok(())
}

async fn add_directory<W>(zip: &mut ZipFileWriter<W>, name: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let builder = ZipEntryBuilder::new(format!("{name}/").into(), Compression::Stored);
    zip.write_entry_whole(builder, &[])
        .await
        .map_err(io::Error::other)
}

async fn add_file<W>(zip: &mut ZipFileWriter<W>, path: &Path, name: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let builder = ZipEntryBuilder::new(name.to_string().into(), Compression::Deflate);
    let entry_writer = zip
        .write_entry_stream(builder)
        .await
        .map_err(io::Error::other)?;
    let mut entry_writer = entry_writer.compat_write();
    tokio::io::copy(&mut file, &mut entry_writer).await?;
    entry_writer
        .into_inner()
        .close()
        .await
        .map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::write_archive;
    use crate::acl::PathAcl;
    use crate::auth::AccessControl;
    use crate::storage::Storage;
    use std::io::{Cursor, Read};
    use tempfile::tempdir;

    async fn archive_names(
        storage: &Storage,
        requested: &str,
        access: &AccessControl,
    ) -> Vec<String> {
        let target = storage.resolve(requested).expect("resolve");
        let is_dir = storage.metadata(&target).await.expect("metadata").is_dir();
        let mut buffer = Vec::new();
        write_archive(&mut buffer, storage, &target, is_dir, access)
            .await
            .expect("write archive");
        let mut archive = zip::ZipArchive::new(Cursor::new(buffer)).expect("read archive");
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        if let Ok(mut file) = archive.by_name("a/b.txt") {
            let mut content = String::new();
            file.read_to_string(&mut content).expect("read entry");
            assert_eq!(content, "bee");
        }
        names
    }

    async fn fixture() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("a/c")).expect("create dirs");
        std::fs::write(temp.path().join("a/b.txt"), b"bee").expect("write file");
        std::fs::write(temp.path().join("a/c/d.txt"), b"dee").expect("write file");
        let storage = Storage::open(temp.path()).await.expect("open root");
        (temp, storage)
    }

    #[tokio::test]
    async fn directory_archive_includes_explicit_dir_entries() {
        let (_temp, storage) = fixture().await;
        let names = archive_names(&storage, "a", &AccessControl::default()).await;
        assert_eq!(names, ["a/", "a/b.txt", "a/c/", "a/c/d.txt"]);
    }

    #[tokio::test]
    async fn root_archive_has_no_root_entry() {
        let (_temp, storage) = fixture().await;
        let names = archive_names(&storage, "/", &AccessControl::default()).await;
        assert_eq!(names, ["a/", "a/b.txt", "a/c/", "a/c/d.txt"]);
    }

    #[tokio::test]
    async fn single_file_archive() {
        let (_temp, storage) = fixture().await;
        let names = archive_names(&storage, "a/b.txt", &AccessControl::default()).await;
        assert_eq!(names, ["a/b.txt"]);
    }

    #[tokio::test]
    async fn denied_entries_are_omitted() {
        let (_temp, storage) = fixture().await;
        let access = AccessControl::new(PathAcl::new(Vec::new(), vec!["/a/c".into()]), None);
        let names = archive_names(&storage, "a", &access).await;
        assert_eq!(names, ["a/", "a/b.txt"]);
    }
}

//! 根目录内的路径解析与目录读写。

use chrono::{DateTime, Local};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::ErrorKind;

use crate::atomic::is_staging_name;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// 解析后的路径：相对根目录的 `/` 分隔形式与对应的绝对路径。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    relative: String,
    absolute: PathBuf,
}

impl ResolvedPath {
    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// 用于 ACL 匹配的 `/` 开头形式。
    pub fn acl_path(&self) -> String {
        format!("/{}", self.relative)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.relative.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// 拼接单个子项名称，名称必须已经是合法的单段文件名。
    pub fn join(&self, name: &str) -> ResolvedPath {
        let relative = if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative, name)
        };
        ResolvedPath {
            relative,
            absolute: self.absolute.join(name),
        }
    }

    /// 是否与 `other` 相同或位于其下。
    pub fn is_within(&self, other: &ResolvedPath) -> bool {
        other.is_root()
            || self.relative == other.relative
            || self
                .relative
                .strip_prefix(other.relative.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Storage {
    /// 规范化并校验配置的根目录，根目录必须是已存在的目录。
    pub async fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref()).await?;
        let metadata = fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 纯词法解析，不访问文件系统。
    pub fn resolve(&self, requested: &str) -> Result<ResolvedPath, StorageError> {
        let relative = normalize(requested)?;
        let mut absolute = self.root.clone();
        for segment in relative.split('/').filter(|segment| !segment.is_empty()) {
            absolute.push(segment);
        }
        if !absolute.starts_with(&self.root) {
            return Err(StorageError::InvalidPath);
        }
        Ok(ResolvedPath { relative, absolute })
    }

    /// 词法解析后再拒绝任何经过符号链接的路径。
    pub async fn resolve_checked(
        &self,
        requested: &str,
        allow_missing_leaf: bool,
    ) -> Result<ResolvedPath, StorageError> {
        let target = self.resolve(requested)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    pub async fn ensure_no_symlink_components(
        &self,
        target: &ResolvedPath,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let mut current = self.root.clone();
        let segments: Vec<&str> = target
            .relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let mut segments = segments.into_iter().peekable();

        while let Some(segment) = segments.next() {
            current.push(segment);
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if segments.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 把根目录下的绝对路径还原成相对形式。
    pub fn relative_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str()?),
                _ => return None,
            }
        }
        Some(segments.join("/"))
    }

    pub async fn metadata(&self, target: &ResolvedPath) -> Result<Metadata, StorageError> {
        Ok(fs::metadata(target.absolute()).await?)
    }

    pub async fn entry(&self, target: &ResolvedPath) -> Result<FileEntry, StorageError> {
        let metadata = self.metadata(target).await?;
        let name = match target.file_name() {
            Some(name) => name.to_string(),
            None => self
                .root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        Ok(FileEntry::from_metadata(
            name,
            target.relative().to_string(),
            &metadata,
        ))
    }

    /// 列出直接子项：目录在前，同类按小写名称排序。符号链接不会出现在结果中。
    pub async fn list_dir(&self, target: &ResolvedPath) -> Result<Vec<FileEntry>, StorageError> {
        let mut dir = fs::read_dir(target.absolute()).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.file_type().is_symlink() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_staging_name(&name) {
                continue;
            }
            let relative = target.join(&name).relative;
            entries.push(FileEntry::from_metadata(name, relative, &metadata));
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    pub async fn delete(&self, target: &ResolvedPath) -> Result<(), StorageError> {
        if target.is_root() {
            return Err(StorageError::InvalidPath);
        }
        let metadata = fs::symlink_metadata(target.absolute()).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target.absolute()).await?;
        } else {
            fs::remove_file(target.absolute()).await?;
        }
        Ok(())
    }

    pub async fn create_dir(&self, target: &ResolvedPath) -> Result<(), StorageError> {
        fs::create_dir_all(target.absolute()).await?;
        Ok(())
    }
}

/// 将请求路径折叠成根目录下的相对路径；`..` 越过根目录时返回错误。
pub fn normalize(requested: &str) -> Result<String, StorageError> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in requested.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::InvalidPath);
                }
            }
            other if other.contains('\0') => return Err(StorageError::InvalidPath),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

pub fn format_timestamp(timestamp: SystemTime) -> String {
    let datetime: DateTime<Local> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: String,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

impl FileEntry {
    pub fn from_metadata(name: String, path: String, metadata: &Metadata) -> Self {
        let modified = metadata.modified().ok();
        Self {
            name,
            path,
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mod_time: modified.map(format_timestamp).unwrap_or_default(),
            modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError, normalize};
    use tempfile::tempdir;

    #[test]
    fn normalize_collapses_dots_and_separators() {
        assert_eq!(normalize("/a/./b//c/").unwrap(), "a/b/c");
        assert_eq!(normalize("a\\b\\c").unwrap(), "a/b/c");
        assert_eq!(normalize("a/b/../c").unwrap(), "a/c");
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("/").unwrap(), "");
    }

    #[test]
    fn normalize_rejects_escape() {
        for raw in ["..", "/../etc/passwd", "a/../../b", "\\..\\x", "a/\0b"] {
            assert!(
                matches!(normalize(raw), Err(StorageError::InvalidPath)),
                "{raw} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn resolve_stays_under_root() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path()).await.expect("open root");
        let inputs = [
            "a", "/a/b", "a/../b", "./x", "x/./y/..", "////z", "a\\..\\b", "..", "../..", "a/../..",
            "%2e%2e",
        ];
        for raw in inputs {
            match storage.resolve(raw) {
                Ok(resolved) => assert!(resolved.absolute().starts_with(storage.root_path())),
                Err(StorageError::InvalidPath) => {}
                Err(err) => panic!("unexpected error for {raw}: {err:?}"),
            }
        }
        let resolved = storage.resolve("a/../b").expect("resolve");
        assert_eq!(resolved.relative(), "b");
        assert_eq!(resolved.acl_path(), "/b");
        assert!(storage.resolve("/").expect("resolve root").is_root());
    }

    #[tokio::test]
    async fn open_requires_existing_directory() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("plain.txt");
        std::fs::write(&file, b"x").expect("write file");

        assert!(Storage::open(&file).await.is_err());
        assert!(Storage::open(temp.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn list_dir_sorts_directories_first() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir(temp.path().join("zeta")).expect("create dir");
        std::fs::write(temp.path().join("Beta.txt"), b"bb").expect("write file");
        std::fs::write(temp.path().join("alpha.txt"), b"a").expect("write file");
        std::fs::write(
            temp.path().join(".alpha.txt.tmp.0f8fad5b-d9cb-469f-a165-70867728950e"),
            b"partial",
        )
        .expect("write staging file");

        let storage = Storage::open(temp.path()).await.expect("open root");
        let root = storage.resolve("/").expect("resolve root");
        let entries = storage.list_dir(&root).await.expect("list");
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha.txt", "Beta.txt"]);
        assert_eq!(entries[2].size, 2);
        assert_eq!(entries[2].path, "Beta.txt");
        assert!(!entries[0].mod_time.is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_root() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path()).await.expect("open root");
        let root = storage.resolve("").expect("resolve root");
        assert!(matches!(
            storage.delete(&root).await,
            Err(StorageError::InvalidPath)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_checked_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside dir");
        std::fs::write(outside.join("secret.txt"), b"secret").expect("write outside file");
        symlink(&outside, root.join("link")).expect("symlink");

        let storage = Storage::open(&root).await.expect("open root");
        let result = storage.resolve_checked("link/secret.txt", false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));

        let listing = storage
            .list_dir(&storage.resolve("").expect("resolve root"))
            .await
            .expect("list");
        assert!(listing.is_empty());
    }
}

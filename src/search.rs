//! 按文件名子串的递归搜索。

use async_walkdir::{Filtering, WalkDir};
use axum::extract::{Extension, Query};
use axum::response::Json as JsonResponse;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::atomic::is_staging_name;
use crate::auth::AccessControl;
use crate::error::ApiError;
use crate::storage::{FileEntry, ResolvedPath, Storage};

pub const DEFAULT_MAX_RESULTS: usize = 100;

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    q: Option<String>,
    max: Option<String>,
    path: Option<String>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    query: String,
    results: Vec<FileEntry>,
    count: usize,
}

/// 并发任务共享的结果集，容量在加锁时检查。
#[derive(Debug)]
pub struct SearchCollector {
    limit: usize,
    results: Mutex<Vec<FileEntry>>,
}

impl SearchCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            results: Mutex::new(Vec::new()),
        }
    }

    pub async fn is_full(&self) -> bool {
        self.results.lock().await.len() >= self.limit
    }

    /// 未满时追加，返回是否被接受。
    pub async fn push(&self, entry: FileEntry) -> bool {
        let mut results = self.results.lock().await;
        if results.len() >= self.limit {
            return false;
        }
        results.push(entry);
        true
    }

    pub async fn take(&self) -> Vec<FileEntry> {
        std::mem::take(&mut *self.results.lock().await)
    }
}

pub async fn search_files(
    Query(query): Query<SearchQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(access): Extension<Arc<AccessControl>>,
) -> Result<JsonResponse<SearchResponse>, ApiError> {
    let needle = query
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing query parameter 'q'".into()))?;
    let max = query
        .max
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|max| *max > 0)
        .unwrap_or(DEFAULT_MAX_RESULTS);
    let scope = access
        .resolve(&storage, query.path.as_deref().unwrap_or("/"), false)
        .await?;
    if !storage.metadata(&scope).await?.is_dir() {
        return Err(ApiError::BadRequest("search path is not a directory".into()));
    }

    let results = search(storage, access, &scope, &needle, max).await;
    info!(query = %needle, count = results.len(), "search");
    Ok(JsonResponse(SearchResponse {
        query: needle,
        count: results.len(),
        results,
    }))
}

/// 遍历 `scope` 下所有条目，名称不区分大小写包含 `needle` 的计入结果。
/// 读取失败的条目直接跳过，达到上限后停止遍历。
pub async fn search(
    storage: Arc<Storage>,
    access: Arc<AccessControl>,
    scope: &ResolvedPath,
    needle: &str,
    max: usize,
) -> Vec<FileEntry> {
    let needle = needle.to_lowercase();
    let collector = Arc::new(SearchCollector::new(max));

    let filter_collector = collector.clone();
    let mut walk = WalkDir::new(scope.absolute()).filter(move |_| {
        let collector = filter_collector.clone();
        async move {
            if collector.is_full().await {
                Filtering::IgnoreDir
            } else {
                Filtering::Continue
            }
        }
    });

    let mut tasks = JoinSet::new();
    while let Some(entry) = walk.next().await {
        if collector.is_full().await {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "search skipped entry");
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_staging_name(&name) || !name.to_lowercase().contains(&needle) {
            continue;
        }
        let path = entry.path();
        let Some(relative) = storage.relative_of(&path) else {
            continue;
        };
        if !access.is_allowed(&format!("/{relative}")) {
            continue;
        }

        let collector = collector.clone();
        tasks.spawn(async move {
            let Ok(metadata) = fs::symlink_metadata(&path).await else {
                return;
            };
            if metadata.file_type().is_symlink() {
                return;
            }
            collector
                .push(FileEntry::from_metadata(name, relative, &metadata))
                .await;
        });
    }
    drop(walk);
    while tasks.join_next().await.is_some() {}

    collector.take().await
}

#[cfg(test)]
mod tests {
    use super::{SearchCollector, search};
    use crate::acl::PathAcl;
    use crate::auth::AccessControl;
    use crate::storage::{FileEntry, Storage};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(name: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            path: name.to_string(),
            is_dir: false,
            size: 0,
            mod_time: String::new(),
            modified: None,
        }
    }

    #[tokio::test]
    async fn collector_never_exceeds_limit_under_concurrency() {
        let collector = Arc::new(SearchCollector::new(7));
        let mut handles = Vec::new();
        for index in 0..100 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                collector.push(entry(&format!("f{index}"))).await
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 7);
        assert!(collector.is_full().await);
        assert_eq!(collector.take().await.len(), 7);
    }

    async fn fixture() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        for dir in ["docs", "docs/deep", "music", "secret"] {
            std::fs::create_dir_all(temp.path().join(dir)).expect("create dir");
        }
        for file in [
            "docs/Report.txt",
            "docs/deep/report-final.txt",
            "music/song.mp3",
            "secret/report.key",
        ] {
            std::fs::write(temp.path().join(file), b"x").expect("write file");
        }
        let storage = Storage::open(temp.path()).await.expect("open root");
        (temp, Arc::new(storage))
    }

    #[tokio::test]
    async fn matches_case_insensitively_and_respects_acl() {
        let (_temp, storage) = fixture().await;
        let access = Arc::new(AccessControl::new(
            PathAcl::new(Vec::new(), vec!["/secret".into()]),
            None,
        ));
        let scope = storage.resolve("/").expect("resolve root");
        let mut paths: Vec<String> = search(storage, access, &scope, "REPORT", 100)
            .await
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        paths.sort();
        assert_eq!(paths, ["docs/Report.txt", "docs/deep/report-final.txt"]);
    }

    #[tokio::test]
    async fn stops_at_max_results() {
        let temp = tempdir().expect("tempdir");
        for index in 0..50 {
            std::fs::write(temp.path().join(format!("match-{index}.txt")), b"x")
                .expect("write file");
        }
        let storage = Arc::new(Storage::open(temp.path()).await.expect("open root"));
        let scope = storage.resolve("").expect("resolve root");
        let results = search(
            storage,
            Arc::new(AccessControl::default()),
            &scope,
            "match",
            10,
        )
        .await;
        assert!(results.len() <= 10);
        assert!(!results.is_empty());
        assert!(results.iter().all(|entry| entry.name.contains("match")));
    }

    #[tokio::test]
    async fn search_is_scoped_to_path() {
        let (_temp, storage) = fixture().await;
        let scope = storage.resolve("music").expect("resolve");
        let results = search(
            storage,
            Arc::new(AccessControl::default()),
            &scope,
            "o",
            100,
        )
        .await;
        let names: Vec<_> = results.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["song.mp3"]);
    }
}

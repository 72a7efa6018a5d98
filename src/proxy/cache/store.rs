use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio::task;
use tracing::warn;

use super::key::EntryPattern;

pub(super) const TEMP_PREFIX: &str = "tmp_";

#[derive(Debug, Clone)]
pub(super) struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub(super) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(super) fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn entry_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub(super) fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Deletes in-progress files left behind by an earlier run, at any depth.
    pub(super) fn remove_temp_files(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        fs::read_dir(&self.root)
            .with_context(|| format!("failed to list cache root {}", self.root.display()))?;
        let removed = walk_files(&self.root)
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| name.starts_with(TEMP_PREFIX))
            })
            .filter(|path| fs::remove_file(path).is_ok())
            .count();
        Ok(removed)
    }

    pub(super) fn find_matching(&self, pattern: &EntryPattern) -> Vec<PathBuf> {
        find_matching(&self.root, pattern)
    }

    pub(super) async fn find_matching_async(&self, pattern: EntryPattern) -> Result<Vec<PathBuf>> {
        let store = self.clone();
        task::spawn_blocking(move || store.find_matching(&pattern))
            .await
            .map_err(|err| anyhow!("cache scan task failed: {err}"))
    }
}

/// Every regular file below `root`, in no particular order. Directories that vanish or cannot
/// be listed while the walk is in progress are skipped.
pub(super) fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                warn!(error = %err, path = %dir.display(), "failed to list cache directory");
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            } else if file_type.is_symlink()
                && fs::metadata(&path)
                    .map(|meta| meta.is_file())
                    .unwrap_or(false)
            {
                // Linked files are served; linked directories are not followed.
                files.push(path);
            }
        }
    }

    files
}

/// Entries below `root` whose file name satisfies `pattern`, sorted by path.
pub(super) fn find_matching(root: &Path, pattern: &EntryPattern) -> Vec<PathBuf> {
    let mut matches: Vec<PathBuf> = walk_files(root)
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| pattern.matches(name))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();
    matches
}

#[cfg(test)]
mod tests {
    use super::super::key::VideoKey;
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"x").expect("write file");
    }

    #[test]
    fn walk_descends_into_nested_directories() -> Result<()> {
        let dir = TempDir::new()?;
        touch(&dir.path().join("sm1-a.mp4"));
        touch(&dir.path().join("2024/01/sm2-b.mp4"));
        touch(&dir.path().join("deep/a/b/c/sm3low-c.flv"));
        fs::create_dir_all(dir.path().join("empty"))?;

        let mut names: Vec<String> = walk_files(dir.path())
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        assert_eq!(names, vec!["sm1-a.mp4", "sm2-b.mp4", "sm3low-c.flv"]);
        Ok(())
    }

    #[test]
    fn walk_of_missing_root_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        assert!(walk_files(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn find_matching_filters_and_sorts() -> Result<()> {
        let dir = TempDir::new()?;
        touch(&dir.path().join("z/sm12-second.mp4"));
        touch(&dir.path().join("a/sm12-first.mp4"));
        touch(&dir.path().join("sm123-other.mp4"));
        touch(&dir.path().join("sm12low-low.mp4"));
        touch(&dir.path().join("tmp_sm12-partial.mp4"));

        let found = find_matching(dir.path(), &EntryPattern::new(VideoKey::primary("12")));
        assert_eq!(
            found,
            vec![
                dir.path().join("a/sm12-first.mp4"),
                dir.path().join("z/sm12-second.mp4"),
            ]
        );
        Ok(())
    }

    #[test]
    fn remove_temp_files_only_touches_temp_prefix() -> Result<()> {
        let dir = TempDir::new()?;
        touch(&dir.path().join("tmp_one"));
        touch(&dir.path().join("nested/tmp_two"));
        touch(&dir.path().join("sm1-keep.mp4"));

        let store = CacheStore::new(dir.path().to_path_buf());
        assert_eq!(store.remove_temp_files()?, 2);
        assert!(!dir.path().join("nested/tmp_two").exists());
        assert!(dir.path().join("sm1-keep.mp4").exists());
        assert!(!dir.path().join("tmp_one").exists());
        Ok(())
    }
}

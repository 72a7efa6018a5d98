use anyhow::{Context, Result, anyhow};
use tokio::{fs as async_fs, task};
use tracing::{info, warn};

use super::key::parse_file_name;
use super::store::{CacheStore, walk_files};

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct StartupStats {
    pub temp_removed: usize,
    pub entries: usize,
}

/// Creates the cache root if needed, removes temp files from interrupted writes and counts
/// the entries already present.
pub(super) async fn prepare_cache_root(store: &CacheStore) -> Result<StartupStats> {
    let root = store.root().to_path_buf();
    async_fs::create_dir_all(&root)
        .await
        .with_context(|| format!("failed to create cache root {}", root.display()))?;

    let scan = {
        let store = store.clone();
        task::spawn_blocking(move || -> Result<StartupStats> {
            let temp_removed = store.remove_temp_files()?;
            let entries = walk_files(store.root())
                .iter()
                .filter_map(|path| path.file_name()?.to_str())
                .filter(|name| parse_file_name(name).is_some())
                .count();
            Ok(StartupStats {
                temp_removed,
                entries,
            })
        })
    };
    let stats = scan
        .await
        .map_err(|err| anyhow!("cache startup scan failed: {err}"))??;

    if stats.temp_removed > 0 {
        warn!(
            removed = stats.temp_removed,
            path = %root.display(),
            "removed partial cache files from previous run"
        );
    }
    info!(path = %root.display(), entries = stats.entries, "video cache ready");
    Ok(stats)
}

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use nicocache::proxy::{AppContext, cache::VideoCache, listener};
use nicocache::settings::Settings;

/// A proxy serving from a private temporary cache root.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub cache: VideoCache,
    cache_dir: PathBuf,
    task: JoinHandle<Result<()>>,
    _root: TempDir,
}

impl ProxyHarness {
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Names of the regular files directly under the cache root, sorted.
    pub fn cached_files(&self) -> Result<Vec<String>> {
        let mut names = std::fs::read_dir(&self.cache_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[derive(Default)]
pub struct ProxyHarnessBuilder {
    seeded: Vec<(String, Vec<u8>)>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a file in the cache root before the proxy starts.
    pub fn with_cached_file(mut self, name: &str, body: impl Into<Vec<u8>>) -> Self {
        self.seeded.push((name.to_string(), body.into()));
        self
    }

    pub async fn spawn(self) -> Result<ProxyHarness> {
        let root = TempDir::new()?;
        let cache_dir = root.path().join("nico");
        std::fs::create_dir_all(&cache_dir)?;
        for (name, body) in &self.seeded {
            std::fs::write(cache_dir.join(name), body)?;
        }

        let socket = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = socket.local_addr()?;
        let settings = Settings {
            listen: addr,
            cache_dir: cache_dir.clone(),
            client_timeout: 5,
            upstream_connect_timeout: 2,
            upstream_timeout: 5,
            max_response_header_size: 8 * 1024,
            max_title_scan_bytes: 64 * 1024,
            ..Settings::default()
        };
        let cache = VideoCache::new(cache_dir.clone(), settings.max_title_scan_bytes).await?;
        let app = AppContext::new(Arc::new(settings), cache.clone());
        let task = tokio::spawn(listener::serve(socket, app));

        Ok(ProxyHarness {
            addr,
            cache,
            cache_dir,
            task,
            _root: root,
        })
    }
}

pub mod cache;
pub mod forward_error;
pub mod headers;
pub mod http;
pub mod listener;
pub mod request;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

/// State shared by every connection.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: cache::VideoCache,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: cache::VideoCache) -> Self {
        Self { settings, cache }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}

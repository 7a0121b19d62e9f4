/// Explicitly constructed application context: configuration, local cache
/// and remote handle, passed to everything that needs them.
use crate::config::Config;
use crate::error::Result;
use crate::remote::http::{Remote, Transport};
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Store,
    pub remote: Remote,
}

impl Context {
    /// Build the production context: sled cache + HTTP transport
    pub fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.data_dir)?;
        let remote = Remote::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            remote,
        })
    }

    /// Build on an injected transport (tests, alternative backends)
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = Store::open(&config.data_dir)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            remote: Remote::with_transport(transport),
        })
    }
}

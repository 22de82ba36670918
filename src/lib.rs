pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod publish;
pub mod tunnel;
pub mod watcher;
pub mod web;

pub mod state {
    use crate::{
        catalog::Catalog,
        config::{Config, ExtensionSets},
        tunnel::TunnelStatus,
    };
    use std::sync::Arc;
    use tokio::sync::{watch, RwLock};

    /// Shared application state. The catalog is held as an `Arc` snapshot
    /// behind the lock: readers clone the `Arc` and release the lock
    /// immediately, writers build a whole new catalog and swap it in, so a
    /// reader never observes a partially rebuilt catalog.
    #[derive(Clone)]
    pub struct AppState {
        pub config: Arc<Config>,
        pub extensions: Arc<ExtensionSets>,
        catalog: Arc<RwLock<Arc<Catalog>>>,
        pub tunnel: watch::Receiver<TunnelStatus>,
    }

    impl AppState {
        pub fn new(
            config: Arc<Config>,
            extensions: Arc<ExtensionSets>,
            catalog: Catalog,
            tunnel: watch::Receiver<TunnelStatus>,
        ) -> Self {
            Self {
                config,
                extensions,
                catalog: Arc::new(RwLock::new(Arc::new(catalog))),
                tunnel,
            }
        }

        /// Current catalog snapshot.
        pub async fn catalog(&self) -> Arc<Catalog> {
            self.catalog.read().await.clone()
        }

        /// Atomically replace the catalog.
        pub async fn install_catalog(&self, catalog: Catalog) {
            *self.catalog.write().await = Arc::new(catalog);
        }
    }
}

pub mod data_layer;
pub mod error;
pub mod increment;
pub mod models;
pub mod replay;
pub mod sync;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::info;

use data_layer::*;
use error::*;
use increment::{build_chain, Increment};
use sync::{SyncProgress, SyncReport, SyncRun};

use crate::{
    timestamp_svc,
    tree_node::{DirectoryBrowser, VirtualNode},
};

/// Everything `sync` and `list` must see consistently
struct Catalog {
    listing: Vec<String>,
    increments: Vec<Increment>,
}

///
/// Keeps a local index of a backup directory and answers point-in-time
/// directory listings from it. Syncs and listings are serialized by one
/// lock; progress can be polled without it.
///
pub struct IndexService {
    backup_dir: PathBuf,
    data_layer: Box<dyn DataLayer>,
    catalog: Mutex<Catalog>,
    progress: Arc<SyncProgress>,
}

impl IndexService {
    ///
    /// Opens or creates the index store at `store_path` for the backup at
    /// `backup_dir`. `listing` is the backup tool's parsable increment
    /// listing, used by the next `sync`.
    ///
    pub async fn open(
        store_path: &Path,
        backup_dir: impl Into<PathBuf>,
        listing: Vec<String>,
    ) -> Result<Self> {
        let data_layer = DbDataLayer::open(store_path).await?;
        Ok(Self::with_data_layer(Box::new(data_layer), backup_dir, listing))
    }

    pub fn with_data_layer(
        data_layer: Box<dyn DataLayer>,
        backup_dir: impl Into<PathBuf>,
        listing: Vec<String>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            data_layer,
            catalog: Mutex::new(Catalog { listing, increments: Vec::new() }),
            progress: Arc::new(SyncProgress::default()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn progress(&self) -> Arc<SyncProgress> {
        self.progress.clone()
    }

    ///
    /// Replaces the increment listing used by the next `sync`
    ///
    pub async fn refresh_listing(&self, listing: Vec<String>) {
        self.catalog.lock().await.listing = listing;
    }

    ///
    /// Brings the index in line with the backup directory and rebuilds the
    /// increment chain. Fails only if the store is unusable or the backup
    /// directory reports a failed previous backup.
    ///
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut catalog = self.catalog.lock().await;
        let timestamps = timestamp_svc::discover(&self.backup_dir, &catalog.listing).await?;
        let data_dir = timestamp_svc::data_dir(&self.backup_dir);

        let report = SyncRun::new(self.data_layer.as_ref(), &data_dir, &self.progress)
            .run(&timestamps)
            .await?;
        catalog.increments = build_chain(&data_dir, &report.retained);
        info!(increments = catalog.increments.len(), "increment chain rebuilt");

        Ok(report)
    }

    ///
    /// The increment chain as of the last sync, newest (the mirror) first
    ///
    pub async fn increments(&self) -> Vec<Increment> {
        self.catalog.lock().await.increments.clone()
    }

    ///
    /// Lists the directory at `path` as it was at `increment`
    ///
    pub async fn list_files(&self, increment: &Increment, path: &str) -> Result<Vec<VirtualNode>> {
        self.list(&VirtualNode::directory(increment.clone(), path)).await
    }
}

impl DirectoryBrowser for IndexService {
    async fn list(&self, node: &VirtualNode) -> Result<Vec<VirtualNode>> {
        let catalog = self.catalog.lock().await;
        let files = replay::list_files(
            self.data_layer.as_ref(),
            &catalog.increments,
            node.increment(),
            &node.segments(),
        ).await?;

        Ok(files
            .into_iter()
            .map(|f| VirtualNode::new(
                node.increment().clone(), Some(node), &f.name, f.size, f.mod_time, f.is_dir(),
            ))
            .collect())
    }
}

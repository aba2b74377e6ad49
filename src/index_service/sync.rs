use std::{
    collections::HashSet,
    path::Path,
    sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use futures_util::{pin_mut, StreamExt};
use tracing::{info, warn};

use super::{
    data_layer::DataLayer,
    error::*,
    models::{DirScope, FileModel},
};
use crate::{
    collections::DirIdCache,
    metadata_svc::{self, ArtifactKind, EntryType, MetadataEntry},
    timestamp_svc::Timestamp,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    Idle = 0,
    Checking = 1,
    Trimming = 2,
    Syncing = 3,
    Compressing = 4,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::Checking,
            2 => SyncPhase::Trimming,
            3 => SyncPhase::Syncing,
            4 => SyncPhase::Compressing,
            _ => SyncPhase::Idle,
        }
    }
}

///
/// Progress of the running sync, readable from any thread while the sync
/// holds the service lock
///
#[derive(Debug, Default)]
pub struct SyncProgress {
    phase: AtomicU8,
    snapshots_total: AtomicUsize,
    snapshots_done: AtomicUsize,
    rows_inserted: AtomicU64,
    rows_deleted: AtomicU64,
}

impl SyncProgress {
    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }
    /// Snapshots (mirror and increments) that this sync has to insert
    pub fn snapshots_total(&self) -> usize {
        self.snapshots_total.load(Ordering::Relaxed)
    }
    pub fn snapshots_done(&self) -> usize {
        self.snapshots_done.load(Ordering::Relaxed)
    }
    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted.load(Ordering::Relaxed)
    }
    pub fn rows_deleted(&self) -> u64 {
        self.rows_deleted.load(Ordering::Relaxed)
    }

    fn enter(&self, phase: SyncPhase) {
        info!(?phase, "sync phase");
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    fn start(&self) {
        self.snapshots_total.store(0, Ordering::Relaxed);
        self.snapshots_done.store(0, Ordering::Relaxed);
        self.rows_inserted.store(0, Ordering::Relaxed);
        self.rows_deleted.store(0, Ordering::Relaxed);
        self.enter(SyncPhase::Checking);
    }
}

///
/// What a sync changed
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub mirror_replaced: bool,
    pub increments_added: Vec<Timestamp>,
    pub increments_removed: Vec<i64>,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    /// Snapshots whose artifacts could not be read; retried on the next sync
    pub failed: Vec<Timestamp>,
    /// Discovered timestamps sharing their epoch with an earlier one
    pub duplicates: Vec<Timestamp>,
    /// Timestamps indexed after the sync, newest first, mirror first
    pub retained: Vec<Timestamp>,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.mirror_replaced
            || !self.increments_added.is_empty()
            || !self.increments_removed.is_empty()
            || self.rows_inserted > 0
            || self.rows_deleted > 0
    }
}

///
/// State of a single sync call
///
pub(crate) struct SyncRun<'a> {
    data_layer: &'a dyn DataLayer,
    data_dir: &'a Path,
    progress: &'a SyncProgress,
    dir_cache: DirIdCache,
    report: SyncReport,
}

impl<'a> SyncRun<'a> {
    pub(crate) fn new(
        data_layer: &'a dyn DataLayer,
        data_dir: &'a Path,
        progress: &'a SyncProgress,
    ) -> Self {
        Self {
            data_layer,
            data_dir,
            progress,
            dir_cache: DirIdCache::new(),
            report: SyncReport::default(),
        }
    }

    ///
    /// Reconciles the store with `discovered` (newest first, mirror first)
    ///
    pub(crate) async fn run(mut self, discovered: &[Timestamp]) -> Result<SyncReport> {
        self.progress.start();
        let result = self.run_phases(discovered).await;
        self.progress.enter(SyncPhase::Idle);
        result?;

        info!(
            changed = self.report.changed(),
            inserted = self.report.rows_inserted,
            deleted = self.report.rows_deleted,
            failed = self.report.failed.len(),
            "sync finished"
        );
        Ok(self.report)
    }

    async fn run_phases(&mut self, discovered: &[Timestamp]) -> Result<()> {
        // Checking
        let distinct = self.dedup(discovered);
        let (mirror, increments) = match distinct.split_first() {
            Some((mirror, increments)) => (Some(mirror), increments),
            None => (None, &[][..]),
        };

        let stored_mirror = self.data_layer.get_mirror_timestamp().await?;
        let mirror_changed = mirror.map(|m| m.epoch) != stored_mirror;

        let stored: HashSet<i64> =
            self.data_layer.get_increment_timestamps().await?.into_iter().collect();
        let on_disk: HashSet<i64> = increments.iter().map(|t| t.epoch).collect();
        let mut to_delete: Vec<i64> = stored.difference(&on_disk).copied().collect();
        to_delete.sort_unstable();
        let to_add: Vec<&Timestamp> =
            increments.iter().rev().filter(|t| !stored.contains(&t.epoch)).collect();

        self.progress.snapshots_total.store(
            usize::from(mirror_changed && mirror.is_some()) + to_add.len(),
            Ordering::Relaxed,
        );
        info!(
            mirror_changed,
            remove = to_delete.len(),
            add = to_add.len(),
            "checked index against backup"
        );

        // Trimming
        if mirror_changed || !to_delete.is_empty() {
            self.progress.enter(SyncPhase::Trimming);
            self.trim(mirror_changed, &to_delete).await?;
        }

        // Syncing
        if (mirror_changed && mirror.is_some()) || !to_add.is_empty() {
            self.progress.enter(SyncPhase::Syncing);
        }
        if let (true, Some(mirror)) = (mirror_changed, mirror) {
            self.report.mirror_replaced = self.sync_snapshot(mirror, DirScope::Mirror).await?;
        }
        for ts in to_add {
            if self.sync_snapshot(ts, DirScope::Increment(ts.epoch)).await? {
                self.report.increments_added.push(ts.clone());
            }
        }

        // Compressing
        if self.report.changed() {
            self.progress.enter(SyncPhase::Compressing);
            if let Err(err) = self.data_layer.compact().await {
                warn!(%err, "could not compact index store");
            }
        }

        self.report.retained = self.retained(&distinct).await?;
        Ok(())
    }

    fn dedup(&mut self, discovered: &[Timestamp]) -> Vec<Timestamp> {
        let mut seen = HashSet::new();
        let mut distinct = Vec::with_capacity(discovered.len());
        for ts in discovered {
            if seen.insert(ts.epoch) {
                distinct.push(ts.clone());
            } else {
                warn!(timestamp = %ts, "backup directory lists the same timestamp twice");
                self.report.duplicates.push(ts.clone());
            }
        }
        distinct
    }

    async fn trim(&mut self, mirror_changed: bool, to_delete: &[i64]) -> Result<()> {
        self.data_layer.begin_batch().await?;
        let deleted = match self.delete_stale(mirror_changed, to_delete).await {
            Ok(deleted) => deleted,
            Err(err) => {
                self.rollback("trim").await;
                return Err(err);
            }
        };
        if let Err(err) = self.data_layer.commit_batch().await {
            self.rollback("trim").await;
            return Err(err.into());
        }

        self.report.increments_removed.extend_from_slice(to_delete);
        self.report.rows_deleted += deleted;
        self.progress.rows_deleted.fetch_add(deleted, Ordering::Relaxed);
        info!(deleted, "trimmed index");
        Ok(())
    }

    async fn delete_stale(&self, mirror_changed: bool, to_delete: &[i64]) -> Result<u64> {
        let mut deleted = 0;
        if mirror_changed {
            deleted += self.data_layer.delete_mirror().await?;
        }
        for &ts in to_delete {
            deleted += self.data_layer.delete_increment(ts).await?;
        }
        Ok(deleted)
    }

    async fn rollback(&self, stage: &str) {
        if let Err(rollback_err) = self.data_layer.rollback_batch().await {
            warn!(stage, %rollback_err, "could not roll back batch");
        }
    }

    ///
    /// Inserts one snapshot in its own transaction. Returns false if its
    /// artifacts could not be read, in which case nothing is kept.
    ///
    async fn sync_snapshot(&mut self, ts: &Timestamp, scope: DirScope) -> Result<bool> {
        self.data_layer.begin_batch().await?;
        let result = self.insert_snapshot(ts, scope).await;
        self.progress.snapshots_done.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(rows) => {
                if let Err(err) = self.data_layer.commit_batch().await {
                    self.rollback("snapshot insert").await;
                    return Err(err.into());
                }
                self.report.rows_inserted += rows;
                info!(timestamp = %ts, rows, "indexed snapshot");
                Ok(true)
            }
            Err(Error::MetadataError(err)) => {
                warn!(timestamp = %ts, %err, "skipping snapshot");
                self.data_layer.rollback_batch().await?;
                self.report.failed.push(ts.clone());
                Ok(false)
            }
            Err(err) => {
                self.rollback("snapshot insert").await;
                Err(err)
            }
        }
    }

    async fn insert_snapshot(&mut self, ts: &Timestamp, scope: DirScope) -> Result<u64> {
        let kind = match scope {
            DirScope::Mirror => {
                self.data_layer.insert_mirror_timestamp(ts.epoch).await?;
                ArtifactKind::Snapshot
            }
            DirScope::Increment(epoch) => {
                self.data_layer.insert_increment_timestamp(epoch).await?;
                ArtifactKind::Diff
            }
        };
        let root_id = self.data_layer.create_root_dir(scope).await?;
        self.dir_cache.reset();

        let path = metadata_svc::find_artifact(self.data_dir, &ts.filestamp, kind).await?;
        let entries = metadata_svc::stream_metadata_file(path);
        pin_mut!(entries);

        let mut rows = 0;
        while let Some(entry) = entries.next().await {
            rows += self.insert_entry(scope, root_id, &entry?).await?;
        }
        Ok(rows)
    }

    async fn insert_entry(&mut self, scope: DirScope, root_id: i64, entry: &MetadataEntry) -> Result<u64> {
        let segments = entry.segments();
        let Some((name, parents)) = segments.split_last() else {
            return Ok(0);
        };

        let dir_id = self.dir_cache.resolve(self.data_layer, scope, root_id, parents).await?;
        if entry.entry_type == EntryType::Dir {
            self.dir_cache.resolve(self.data_layer, scope, root_id, &segments).await?;
        }

        let affected = self.data_layer
            .insert_file(scope, dir_id, &FileModel::from_entry(name, entry))
            .await?;
        if affected != 1 {
            warn!(path = %entry.path, affected, "file row insert did not affect exactly one row");
        }
        self.progress.rows_inserted.fetch_add(affected, Ordering::Relaxed);
        Ok(affected)
    }

    async fn retained(&self, distinct: &[Timestamp]) -> Result<Vec<Timestamp>> {
        let Some(stored_mirror) = self.data_layer.get_mirror_timestamp().await? else {
            return Ok(Vec::new());
        };
        let stored: HashSet<i64> = self.data_layer.get_increment_timestamps().await?.into_iter().collect();

        let mut retained = Vec::with_capacity(distinct.len());
        for (pos, ts) in distinct.iter().enumerate() {
            let indexed = if pos == 0 { ts.epoch == stored_mirror } else { stored.contains(&ts.epoch) };
            if pos == 0 && !indexed {
                return Ok(Vec::new());
            }
            if indexed {
                retained.push(ts.clone());
            }
        }
        Ok(retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_layer_error::DataLayerError,
        index_service::data_layer::{DbDataLayer, MockDataLayer},
    };

    #[tokio::test]
    async fn test_failed_delete_rolls_back_trim() {
        let mut mock_dl = MockDataLayer::new();
        mock_dl.expect_get_mirror_timestamp().returning(|| Ok(None));
        mock_dl.expect_get_increment_timestamps().returning(|| Ok(vec![100]));
        mock_dl.expect_begin_batch().times(1).returning(|| Ok(()));
        mock_dl.expect_delete_increment()
            .returning(|_| Err(DataLayerError::Query(sqlx::Error::RowNotFound)));
        mock_dl.expect_commit_batch().never();
        mock_dl.expect_rollback_batch().times(1).returning(|| Ok(()));

        let progress = SyncProgress::default();
        let result = SyncRun::new(&mock_dl, Path::new("/data"), &progress).run(&[]).await;

        assert!(matches!(result, Err(Error::DataLayerError(_))));
        assert_eq!(progress.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_store_usable_after_failed_trim() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        dl.insert_increment_timestamp(100).await.unwrap();
        dl.create_root_dir(DirScope::Increment(100)).await.unwrap();
        sqlx::query("DROP TABLE increment_files").execute(dl.pool()).await.unwrap();

        let progress = SyncProgress::default();
        assert!(SyncRun::new(&dl, Path::new("/data"), &progress).run(&[]).await.is_err());
        assert_eq!(dl.get_increment_timestamps().await.unwrap(), vec![100]);

        sqlx::query(
            "CREATE TABLE increment_files (id INTEGER NOT NULL, name TEXT NOT NULL, \
             type TEXT NOT NULL, size INTEGER NOT NULL, mod_time INTEGER NOT NULL)"
        )
            .execute(dl.pool()).await.unwrap();

        let report = SyncRun::new(&dl, Path::new("/data"), &progress).run(&[]).await.unwrap();
        assert_eq!(report.increments_removed, vec![100]);
        assert!(dl.get_increment_timestamps().await.unwrap().is_empty());
        assert!(report.retained.is_empty());
    }
}

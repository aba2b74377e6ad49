use std::{
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::OnceCell;

use crate::timestamp_svc::{self, Timestamp};

const MIRROR_SIZE_KEY: &str = "SourceFileSize";
const INCREMENT_SIZE_KEY: &str = "IncrementFileSize";

///
/// One retained point in time. Increments live in a flat chain ordered
/// newest first; position 0 is the mirror and every other increment points
/// at the position of its next-younger neighbour.
///
#[derive(Clone, Debug)]
pub struct Increment {
    timestamp: Timestamp,
    position: usize,
    younger: Option<usize>,
    size_artifact: PathBuf,
    size: Arc<OnceCell<u64>>,
}

impl Increment {
    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Position of the next-younger increment, `None` for the mirror
    pub fn younger(&self) -> Option<usize> {
        self.younger
    }

    pub fn is_mirror(&self) -> bool {
        self.younger.is_none()
    }

    ///
    /// Size in bytes, read from the statistics artifacts on first use. The
    /// mirror reports its source size; an increment reports the size of the
    /// reverse diffs written by the next-younger session.
    ///
    pub async fn size(&self) -> timestamp_svc::error::Result<u64> {
        let key = if self.is_mirror() { MIRROR_SIZE_KEY } else { INCREMENT_SIZE_KEY };
        self.size
            .get_or_try_init(|| async {
                timestamp_svc::read_statistic(&self.size_artifact, key)
                    .await
                    .map(|v| v.unwrap_or(0))
            })
            .await
            .copied()
    }
}

impl PartialEq for Increment {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for Increment {}

impl Hash for Increment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.timestamp.hash(state);
    }
}

///
/// Builds the increment chain from timestamps ordered newest first
///
pub fn build_chain(data_dir: &Path, timestamps: &[Timestamp]) -> Vec<Increment> {
    timestamps
        .iter()
        .enumerate()
        .map(|(position, timestamp)| {
            let younger = position.checked_sub(1);
            let stats_owner = younger.map(|y| &timestamps[y]).unwrap_or(timestamp);
            Increment {
                timestamp: timestamp.clone(),
                position,
                younger,
                size_artifact: timestamp_svc::statistics_path(data_dir, &stats_owner.filestamp),
                size: Arc::new(OnceCell::new()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_point_at_younger_neighbour() {
        let stamps = vec![Timestamp::new(300, "c"), Timestamp::new(200, "b"), Timestamp::new(100, "a")];
        let chain = build_chain(Path::new("/data"), &stamps);

        assert_eq!(chain.len(), 3);
        assert!(chain[0].is_mirror());
        assert_eq!(chain[1].younger(), Some(0));
        assert_eq!(chain[2].younger(), Some(1));
        assert_eq!(chain[2].position(), 2);
        assert_eq!(chain[2].size_artifact, timestamp_svc::statistics_path(Path::new("/data"), "b"));
        assert_eq!(chain[0].size_artifact, timestamp_svc::statistics_path(Path::new("/data"), "c"));
    }

    #[tokio::test]
    async fn test_size_reads_from_owning_artifact_once() {
        let dir = tempfile::tempdir().unwrap();
        let stamps = vec![Timestamp::new(200, "b"), Timestamp::new(100, "a")];
        std::fs::write(
            timestamp_svc::statistics_path(dir.path(), "b"),
            "StartTime 200.0\nSourceFileSize 5000 (5 KB)\nIncrementFileSize 120 (120 B)\n",
        ).unwrap();
        let chain = build_chain(dir.path(), &stamps);

        assert_eq!(chain[0].size().await.unwrap(), 5000);
        assert_eq!(chain[1].size().await.unwrap(), 120);

        std::fs::remove_file(timestamp_svc::statistics_path(dir.path(), "b")).unwrap();
        assert_eq!(chain[1].clone().size().await.unwrap(), 120);
    }
}

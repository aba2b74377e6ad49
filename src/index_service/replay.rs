use std::collections::BTreeMap;

use tracing::debug;

use super::{
    data_layer::DataLayer,
    error::*,
    increment::Increment,
    models::{DirScope, FileModel, MIRROR_ROOT_ID},
};
use crate::collections::lookup;

///
/// Increments to replay to reach `target`: gathered by walking next-younger
/// links from `target` toward the mirror, returned youngest first.
///
fn replay_order<'a>(chain: &'a [Increment], target: &Increment) -> Vec<&'a Increment> {
    let mut order = Vec::new();
    let mut cursor = Some(target.position());
    while let Some(inc) = cursor.and_then(|pos| chain.get(pos)) {
        if inc.is_mirror() {
            break;
        }
        order.push(inc);
        cursor = inc.younger();
    }
    order.reverse();
    order
}

///
/// Reconstructs the listing of the directory at `segments` as it was at
/// `target`. Starts from the mirror's rows and applies every increment's
/// reverse diff, youngest first, ending with `target` itself.
///
pub async fn list_files(
    data_layer: &dyn DataLayer,
    chain: &[Increment],
    target: &Increment,
    segments: &[&str],
) -> Result<Vec<FileModel>> {
    if chain.get(target.position()) != Some(target) {
        return Err(Error::UnknownIncrement(target.timestamp().clone()));
    }

    let mut working: BTreeMap<String, FileModel> = BTreeMap::new();
    if let Some(dir_id) = lookup(data_layer, DirScope::Mirror, MIRROR_ROOT_ID, segments).await? {
        for file in data_layer.get_dir_files(DirScope::Mirror, dir_id).await? {
            working.insert(file.name.clone(), file);
        }
    }

    if target.is_mirror() {
        return Ok(working.into_values().collect());
    }

    for inc in replay_order(chain, target) {
        let scope = DirScope::Increment(inc.timestamp().epoch);
        let Some(root_id) = data_layer.get_root_dir(scope).await? else {
            debug!(increment = %inc.timestamp(), "increment has no indexed tree");
            continue;
        };
        let Some(dir_id) = lookup(data_layer, scope, root_id, segments).await? else {
            continue;
        };

        let diff = data_layer.get_dir_files(scope, dir_id).await?;
        debug!(increment = %inc.timestamp(), changes = diff.len(), "replaying directory diff");
        for file in diff {
            if file.is_removed() {
                working.remove(&file.name);
            } else {
                working.insert(file.name.clone(), file);
            }
        }
    }

    Ok(working.into_values().collect())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use mockall::predicate::eq;

    use super::*;
    use crate::{
        index_service::{data_layer::MockDataLayer, increment::build_chain},
        timestamp_svc::Timestamp,
    };

    fn file(name: &str, file_type: &str, size: i64) -> FileModel {
        FileModel { name: name.into(), file_type: file_type.into(), size, mod_time: 0 }
    }

    fn three_point_chain() -> Vec<Increment> {
        build_chain(
            Path::new("/data"),
            &[Timestamp::new(300, "m"), Timestamp::new(200, "t2"), Timestamp::new(100, "t1")],
        )
    }

    fn names(files: &[FileModel]) -> Vec<&str> {
        files.iter().map(|f| f.name.as_str()).collect()
    }

    /// Mirror `/a = {x}`; each increment resolves `/a` to its own id `epoch + 1`
    fn mock_with_diffs(diffs: Vec<(i64, Vec<FileModel>)>) -> MockDataLayer {
        let mut mock_dl = MockDataLayer::new();
        mock_dl.expect_get_dir().with(eq(DirScope::Mirror), eq(MIRROR_ROOT_ID), eq("a"))
            .returning(|_, _, _| Ok(Some(2)));
        mock_dl.expect_get_dir_files().with(eq(DirScope::Mirror), eq(2))
            .returning(|_, _| Ok(vec![file("x", "reg", 1)]));

        for (ts, rows) in diffs {
            let scope = DirScope::Increment(ts);
            mock_dl.expect_get_root_dir().with(eq(scope)).returning(move |_| Ok(Some(ts)));
            mock_dl.expect_get_dir().with(eq(scope), eq(ts), eq("a"))
                .returning(move |_, _, _| Ok(Some(ts + 1)));
            mock_dl.expect_get_dir_files().with(eq(scope), eq(ts + 1))
                .returning(move |_, _| Ok(rows.clone()));
        }
        mock_dl
    }

    #[test]
    fn test_replay_order_is_youngest_first() {
        let chain = three_point_chain();
        let order: Vec<i64> = replay_order(&chain, &chain[2]).iter().map(|i| i.timestamp().epoch).collect();
        assert_eq!(order, vec![200, 100]);
        assert!(replay_order(&chain, &chain[0]).is_empty());
    }

    #[tokio::test]
    async fn test_removed_entry_is_dropped_and_added_entry_kept() {
        let chain = build_chain(Path::new("/data"), &[Timestamp::new(300, "m"), Timestamp::new(100, "t1")]);
        let mock_dl = mock_with_diffs(vec![(100, vec![file("x", "None", 0), file("y", "reg", 5)])]);

        let at_increment = list_files(&mock_dl, &chain, &chain[1], &["a"]).await.unwrap();
        assert_eq!(at_increment, vec![file("y", "reg", 5)]);

        let at_mirror = list_files(&mock_dl, &chain, &chain[0], &["a"]).await.unwrap();
        assert_eq!(names(&at_mirror), vec!["x"]);
    }

    #[tokio::test]
    async fn test_multiple_increments_replay_in_order() {
        let chain = three_point_chain();
        let mock_dl = mock_with_diffs(vec![
            (200, vec![file("x", "reg", 20)]),
            (100, vec![file("x", "reg", 10)]),
        ]);

        assert_eq!(list_files(&mock_dl, &chain, &chain[2], &["a"]).await.unwrap()[0].size, 10);
        assert_eq!(list_files(&mock_dl, &chain, &chain[1], &["a"]).await.unwrap()[0].size, 20);
        assert_eq!(list_files(&mock_dl, &chain, &chain[0], &["a"]).await.unwrap()[0].size, 1);
    }

    #[tokio::test]
    async fn test_increment_without_changes_in_directory_is_skipped() {
        let chain = three_point_chain();
        let mut mock_dl = mock_with_diffs(vec![(100, vec![file("z", "reg", 3)])]);
        mock_dl.expect_get_root_dir().with(eq(DirScope::Increment(200))).returning(|_| Ok(Some(50)));
        mock_dl.expect_get_dir().with(eq(DirScope::Increment(200)), eq(50), eq("a"))
            .returning(|_, _, _| Ok(None));

        let files = list_files(&mock_dl, &chain, &chain[2], &["a"]).await.unwrap();
        assert_eq!(names(&files), vec!["x", "z"]);
    }

    #[tokio::test]
    async fn test_directory_only_in_increment() {
        let chain = build_chain(Path::new("/data"), &[Timestamp::new(300, "m"), Timestamp::new(100, "t1")]);
        let mut mock_dl = MockDataLayer::new();
        mock_dl.expect_get_dir().with(eq(DirScope::Mirror), eq(MIRROR_ROOT_ID), eq("old"))
            .returning(|_, _, _| Ok(None));
        mock_dl.expect_get_root_dir().returning(|_| Ok(Some(10)));
        mock_dl.expect_get_dir().with(eq(DirScope::Increment(100)), eq(10), eq("old"))
            .returning(|_, _, _| Ok(Some(11)));
        mock_dl.expect_get_dir_files().with(eq(DirScope::Increment(100)), eq(11))
            .returning(|_, _| Ok(vec![file("gone.txt", "reg", 8)]));

        let files = list_files(&mock_dl, &chain, &chain[1], &["old"]).await.unwrap();
        assert_eq!(names(&files), vec!["gone.txt"]);
        assert!(list_files(&mock_dl, &chain, &chain[0], &["old"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_increment_is_rejected() {
        let chain = three_point_chain();
        let stale = build_chain(Path::new("/data"), &[Timestamp::new(400, "n"), Timestamp::new(150, "s")]);
        let mock_dl = MockDataLayer::new();

        assert!(matches!(
            list_files(&mock_dl, &chain, &stale[1], &[]).await,
            Err(Error::UnknownIncrement(_))
        ));
    }
}

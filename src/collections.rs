use crate::{
    data_layer_error::Result,
    index_service::{data_layer::DataLayer, models::DirScope},
};

///
/// A positional cache of resolved directory IDs. Position `i` holds the
/// name and ID of the `i`th path segment last resolved, so consecutive
/// paths sharing a prefix skip the store for that prefix.
///
#[derive(Debug, Default)]
pub struct DirIdCache {
    entries: Vec<(String, i64)>,
    hits: u64,
    misses: u64,
}

impl DirIdCache {
    ///
    /// Creates a new, empty DirIdCache
    ///
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Forgets every cached segment. Must be called whenever the directory
    /// tree being resolved against changes.
    ///
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    ///
    /// Resolves the directory at `segments` below `root_id`, creating any
    /// missing directory along the way, and returns its ID
    ///
    pub async fn resolve(
        &mut self,
        data_layer: &dyn DataLayer,
        scope: DirScope,
        root_id: i64,
        segments: &[&str],
    ) -> Result<i64> {
        let mut parent_id = root_id;
        for (pos, &name) in segments.iter().enumerate() {
            if let Some((cached_name, id)) = self.entries.get(pos) {
                if cached_name == name {
                    self.hits += 1;
                    parent_id = *id;
                    continue;
                }
            }

            self.misses += 1;
            parent_id = resolve_or_insert(data_layer, scope, parent_id, name).await?;
            // Everything deeper belonged to the previous, diverged path
            self.entries.truncate(pos);
            self.entries.push((name.to_string(), parent_id));
        }

        Ok(parent_id)
    }
}

async fn resolve_or_insert(
    data_layer: &dyn DataLayer,
    scope: DirScope,
    parent_id: i64,
    name: &str,
) -> Result<i64> {
    match data_layer.get_dir(scope, parent_id, name).await? {
        Some(id) => Ok(id),
        None => data_layer.create_dir(scope, parent_id, name).await,
    }
}

///
/// Resolves `segments` below `root_id` without a cache, creating missing
/// directories
///
pub async fn resolve_uncached(
    data_layer: &dyn DataLayer,
    scope: DirScope,
    root_id: i64,
    segments: &[&str],
) -> Result<i64> {
    let mut parent_id = root_id;
    for name in segments {
        parent_id = resolve_or_insert(data_layer, scope, parent_id, name).await?;
    }
    Ok(parent_id)
}

///
/// Looks up the directory at `segments` below `root_id` without creating
/// anything. Returns `None` as soon as a segment is missing.
///
pub async fn lookup(
    data_layer: &dyn DataLayer,
    scope: DirScope,
    root_id: i64,
    segments: &[&str],
) -> Result<Option<i64>> {
    let mut parent_id = root_id;
    for name in segments {
        match data_layer.get_dir(scope, parent_id, name).await? {
            Some(id) => parent_id = id,
            None => return Ok(None),
        }
    }
    Ok(Some(parent_id))
}

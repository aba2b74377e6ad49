use crate::metadata_svc::{EntryType, MetadataEntry};

/// Identifier of the mirror's root directory row
pub const MIRROR_ROOT_ID: i64 = 1;

///
/// Which directory tree a row belongs to: the single mirror tree, or the
/// tree of the increment taken at the given epoch seconds
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirScope {
    Mirror,
    Increment(i64),
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct FileModel {
    pub name: String,
    pub file_type: String,
    pub size: i64,
    pub mod_time: i64,
}

impl FileModel {
    pub fn from_entry(name: &str, entry: &MetadataEntry) -> Self {
        Self {
            name: name.to_string(),
            file_type: entry.entry_type.as_str().to_string(),
            size: entry.size,
            mod_time: entry.mod_time,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        EntryType::parse(&self.file_type)
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type() == EntryType::Dir
    }

    pub fn is_removed(&self) -> bool {
        self.entry_type() == EntryType::Missing
    }
}

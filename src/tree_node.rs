use std::{future::Future, hash::{Hash, Hasher}};

use crate::index_service::{error::Result, increment::Increment};

///
/// Canonicalizes an absolute, `/`-separated path as plain text: drops empty
/// and `.` segments and lets `..` remove the preceding segment. `..` never
/// climbs above the root.
///
pub fn canonicalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => { segments.pop(); }
            name => segments.push(name),
        }
    }
    format!("/{}", segments.join("/"))
}

///
/// Something that can list the children of a `VirtualNode`
///
pub trait DirectoryBrowser {
    fn list(&self, node: &VirtualNode) -> impl Future<Output = Result<Vec<VirtualNode>>> + Send;
}

///
/// A read-only entry of the backup tree as it existed at one increment.
/// Nodes carry no store state; listing children goes back to a
/// `DirectoryBrowser`.
///
#[derive(Clone, Debug)]
pub struct VirtualNode {
    increment: Increment,
    parent_path: Option<String>,
    name: String,
    path: String,
    size: i64,
    mod_time: i64,
    is_directory: bool,
}

impl VirtualNode {
    pub fn new(
        increment: Increment,
        parent: Option<&VirtualNode>,
        name: &str,
        size: i64,
        mod_time: i64,
        is_directory: bool,
    ) -> Self {
        let path = match parent {
            Some(parent) => canonicalize(&format!("{}/{}", parent.path, name)),
            None => canonicalize(name),
        };
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            increment,
            parent_path: parent.map(|p| p.path.clone()),
            name,
            path,
            size,
            mod_time,
            is_directory,
        }
    }

    ///
    /// The root directory of the backup tree at `increment`
    ///
    pub fn root(increment: Increment) -> Self {
        let mod_time = increment.timestamp().epoch;
        Self::new(increment, None, "/", 0, mod_time, true)
    }

    ///
    /// A directory node for an arbitrary path, with no size or time of its own
    ///
    pub fn directory(increment: Increment, path: &str) -> Self {
        Self::new(increment, None, path, 0, 0, true)
    }

    pub fn increment(&self) -> &Increment {
        &self.increment
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment, empty for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.parent_path.as_deref()
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Modification time in epoch seconds
    pub fn mod_time(&self) -> i64 {
        self.mod_time
    }

    pub fn mod_time_millis(&self) -> i64 {
        self.mod_time * 1000
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub async fn list_children<B: DirectoryBrowser>(
        &self,
        browser: &B,
    ) -> Result<Vec<VirtualNode>> {
        if !self.is_directory {
            return Ok(Vec::new());
        }
        browser.list(self).await
    }
}

impl PartialEq for VirtualNode {
    fn eq(&self, other: &Self) -> bool {
        self.increment == other.increment && self.path == other.path
    }
}

impl Eq for VirtualNode {}

impl Hash for VirtualNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.increment.hash(state);
        self.path.hash(state);
    }
}

pub mod error;

use std::{
    fmt::Display,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use error::*;

const CHANNEL_CAPACITY: usize = 1024;

///
/// The type tag of a metadata entry. `Missing` is the backup tool's `None`
/// sentinel: the entry did not exist at that point in time.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    Dir,
    Regular,
    Symlink,
    Other(String),
    Missing,
}

impl EntryType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "dir" => EntryType::Dir,
            "reg" => EntryType::Regular,
            "sym" => EntryType::Symlink,
            "None" => EntryType::Missing,
            other => EntryType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntryType::Dir => "dir",
            EntryType::Regular => "reg",
            EntryType::Symlink => "sym",
            EntryType::Other(tag) => tag,
            EntryType::Missing => "None",
        }
    }
}

impl Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

///
/// One `File` stanza of a metadata artifact
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    pub path: String,
    pub entry_type: EntryType,
    pub size: i64,
    pub mod_time: i64,
}

impl MetadataEntry {
    fn new(path: String) -> Self {
        Self { path, entry_type: EntryType::Missing, size: 0, mod_time: 0 }
    }

    /// Path segments relative to the backup root. The root itself (`.`) has none.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
    }
}

///
/// Streams `MetadataEntry` values out of line-oriented, already decompressed
/// metadata text. Paths are raw bytes on disk; invalid UTF-8 is decoded
/// lossily so one odd file name does not end the stream.
///
pub struct MetadataReader<R> {
    reader: R,
    buf: Vec<u8>,
    current: Option<MetadataEntry>,
    line_no: usize,
}

impl<R: BufRead> MetadataReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buf: Vec::new(), current: None, line_no: 0 }
    }

    fn read_line(&mut self) -> Option<std::io::Result<String>> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&self.buf);
                if let std::borrow::Cow::Owned(_) = line {
                    warn!(line_no = self.line_no + 1, "metadata line is not valid UTF-8");
                }
                Some(Ok(line.into_owned()))
            }
            Err(err) => Some(Err(err)),
        }
    }

    fn apply_field(&mut self, key: &str, value: &str) {
        let Some(entry) = self.current.as_mut() else {
            warn!(line_no = self.line_no, key, "field outside of a File stanza");
            return;
        };
        match key {
            "Type" => entry.entry_type = EntryType::parse(value),
            "Size" => match value.parse() {
                Ok(size) => entry.size = size,
                Err(_) => warn!(line_no = self.line_no, value, "malformed Size"),
            },
            "ModTime" => match value.parse() {
                Ok(mod_time) => entry.mod_time = mod_time,
                Err(_) => warn!(line_no = self.line_no, value, "malformed ModTime"),
            },
            _ => {}
        }
    }
}

impl<R: BufRead> Iterator for MetadataReader<R> {
    type Item = std::io::Result<MetadataEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.read_line() {
                Some(Ok(line)) => line,
                Some(Err(err)) => return Some(Err(err)),
                None => return self.current.take().map(Ok),
            };
            self.line_no += 1;

            if let Some(path) = line.strip_prefix("File ") {
                let finished = self.current.replace(MetadataEntry::new(unquote_path(path)));
                if let Some(entry) = finished {
                    return Some(Ok(entry));
                }
                continue;
            }

            let mut fields = line.trim().splitn(2, ' ');
            if let (Some(key), Some(value)) = (fields.next(), fields.next()) {
                self.apply_field(key, value.trim());
            }
        }
    }
}

///
/// Reverses the backup tool's quoting of newlines and backslashes in paths
///
fn unquote_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

///
/// Which artifact flavor to look for first: full snapshot for the mirror,
/// reverse diff for increments
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Snapshot,
    Diff,
}

impl ArtifactKind {
    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Snapshot => "snapshot.gz",
            ArtifactKind::Diff => "diff.gz",
        }
    }

    fn other(self) -> Self {
        match self {
            ArtifactKind::Snapshot => ArtifactKind::Diff,
            ArtifactKind::Diff => ArtifactKind::Snapshot,
        }
    }
}

pub fn metadata_path(data_dir: &Path, filestamp: &str, kind: ArtifactKind) -> PathBuf {
    data_dir.join(format!("mirror_metadata.{}.{}", filestamp, kind.suffix()))
}

///
/// Finds the metadata artifact of the snapshot named by `filestamp`,
/// preferring `kind` and falling back to the other flavor
///
pub async fn find_artifact(
    data_dir: &Path,
    filestamp: &str,
    kind: ArtifactKind,
) -> Result<PathBuf> {
    for kind in [kind, kind.other()] {
        let path = metadata_path(data_dir, filestamp, kind);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
    }
    Err(Error::MissingArtifact(filestamp.to_string()))
}

///
/// Streams the entries of a gzip-compressed metadata artifact. Decompression
/// and parsing run on the blocking pool; the stream ends after the first error.
///
pub fn stream_metadata_file(path: PathBuf) -> impl Stream<Item = Result<MetadataEntry>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(source) => {
                let _ = tx.blocking_send(Err(Error::Io { path, source }));
                return;
            }
        };

        for entry in MetadataReader::new(BufReader::new(GzDecoder::new(file))) {
            let entry = entry.map_err(|source| Error::Io { path: path.clone(), source });
            let failed = entry.is_err();
            if tx.blocking_send(entry).is_err() || failed {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}

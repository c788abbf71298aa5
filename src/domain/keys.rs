use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle for one workspace in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(Uuid);

impl BucketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BucketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BucketId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for BucketId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identity of one live document: a bucket plus a normalized `/`-separated
/// file path. Construction rejects traversal components, so a key can be
/// embedded into object-store keys and filesystem paths verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    bucket: BucketId,
    path: String,
}

impl DocumentKey {
    pub fn new(bucket: BucketId, raw_path: &str) -> Option<Self> {
        let path = normalize_path(raw_path)?;
        Some(Self { bucket, path })
    }

    pub fn bucket(&self) -> &BucketId {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.path)
    }
}

/// Collapses separators and dot segments; rejects empty results and any
/// `..` component.
fn normalize_path(raw: &str) -> Option<String> {
    let candidate = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in candidate.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Producer of an applied update, carried alongside the opaque bytes through
/// the store log and the router so echoes can be suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A browser tab or service connection.
    Peer { conn: Uuid },
    /// A container agent mirroring its filesystem.
    FilesystemSync { conn: Uuid },
    /// Produced by the engine itself (hydration, administrative edits).
    Server,
}

impl Origin {
    pub fn connection(&self) -> Option<Uuid> {
        match self {
            Origin::Peer { conn } | Origin::FilesystemSync { conn } => Some(*conn),
            Origin::Server => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dot_segments() {
        let bucket = BucketId::new();
        let key = DocumentKey::new(bucket, "./src//main.py").unwrap();
        assert_eq!(key.path(), "src/main.py");

        let key = DocumentKey::new(bucket, "/notes/readme.md").unwrap();
        assert_eq!(key.path(), "notes/readme.md");

        let key = DocumentKey::new(bucket, "a\\b\\c.txt").unwrap();
        assert_eq!(key.path(), "a/b/c.txt");
    }

    #[test]
    fn rejects_traversal_and_empty_paths() {
        let bucket = BucketId::new();
        assert!(DocumentKey::new(bucket, "../etc/passwd").is_none());
        assert!(DocumentKey::new(bucket, "src/../../secret").is_none());
        assert!(DocumentKey::new(bucket, "").is_none());
        assert!(DocumentKey::new(bucket, "///").is_none());
    }

    #[test]
    fn origin_connection_ids() {
        let conn = Uuid::new_v4();
        assert_eq!(Origin::Peer { conn }.connection(), Some(conn));
        assert_eq!(Origin::FilesystemSync { conn }.connection(), Some(conn));
        assert_eq!(Origin::Server.connection(), None);
    }
}

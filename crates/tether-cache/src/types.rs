//! Remote file descriptions shared by the cache layers and the session layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mode bit marking a directory (`S_IFDIR`).
pub const MODE_DIR: u32 = 0o040000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Metadata for a remote file, as returned by a stat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
}

impl FileStat {
    pub fn file(size: u64, mode: u32) -> Self {
        Self {
            file_type: FileType::File,
            size,
            mode,
            uid: 0,
            gid: 0,
            atime_ms: 0,
            mtime_ms: 0,
            ctime_ms: 0,
        }
    }

    pub fn directory(mode: u32) -> Self {
        Self {
            file_type: FileType::Directory,
            size: 0,
            mode: mode | MODE_DIR,
            uid: 0,
            gid: 0,
            atime_ms: 0,
            mtime_ms: 0,
            ctime_ms: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory || self.mode & MODE_DIR != 0
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        Self {
            name: name.into(),
            file_type,
        }
    }
}

/// A path on a specific remote connection. Cache keys are `connection_id:path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    pub connection_id: String,
    pub path: String,
}

impl RemotePath {
    pub fn new(connection_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            path: path.into(),
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.path)
    }

    pub fn parent(&self) -> RemotePath {
        RemotePath {
            connection_id: self.connection_id.clone(),
            path: parent_path(&self.path),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.path)
    }
}

/// Posix-style dirname. Trailing slashes are ignored and the root is its own parent.
pub fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = trimmed[..idx].trim_end_matches('/');
            if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            }
        }
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of_nested_file() {
        assert_eq!(parent_path("/home/user/file.txt"), "/home/user");
    }

    #[test]
    fn test_parent_ignores_trailing_slash() {
        assert_eq!(parent_path("/home/user/dir/"), "/home/user");
    }

    #[test]
    fn test_parent_of_top_level_is_root() {
        assert_eq!(parent_path("/etc"), "/");
        assert_eq!(parent_path("//etc"), "/");
    }

    #[test]
    fn test_parent_of_root_is_root() {
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("///"), "/");
    }

    #[test]
    fn test_parent_of_relative_name() {
        assert_eq!(parent_path("notes.md"), ".");
    }

    #[test]
    fn test_cache_key_format() {
        let p = RemotePath::new("conn-1", "/srv/data");
        assert_eq!(p.cache_key(), "conn-1:/srv/data");
        assert_eq!(p.to_string(), "conn-1:/srv/data");
        assert_eq!(p.parent().cache_key(), "conn-1:/srv");
    }

    #[test]
    fn test_directory_stat_sets_mode_bit() {
        let stat = FileStat::directory(0o755);
        assert!(stat.is_dir());
        assert_eq!(stat.mode & MODE_DIR, MODE_DIR);
        assert!(!FileStat::file(10, 0o644).is_dir());
    }
}

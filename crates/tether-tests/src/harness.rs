//! Scripted remote host.
//!
//! [`ScriptedRemote`] is a [`Connector`] whose transports share one in-memory
//! filesystem. Tests queue failures for the next handshakes, commands, file
//! operations or closes, and read back counters afterwards.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_cache::{parent_path, DirEntry, FileStat, FileType};
use tether_session::{
    AuthMethod, CommandOutput, ConnectionConfig, Connector, FileChannel, RawError, ShellChannel,
    ShellRequest, Transport,
};

pub fn network_error() -> RawError {
    RawError::with_code("read ECONNRESET", "ECONNRESET")
}

pub fn timeout_error() -> RawError {
    RawError::with_code("connect ETIMEDOUT 10.0.0.1:22", "ETIMEDOUT")
}

pub fn refused_error() -> RawError {
    RawError::with_code("connect ECONNREFUSED 10.0.0.1:22", "ECONNREFUSED")
}

pub fn auth_error() -> RawError {
    RawError::new("All configured authentication methods failed")
}

pub fn not_found(path: &str) -> RawError {
    RawError::with_code(format!("No such file: {}", path), "ENOENT")
}

/// Password-authenticated config for `host`.
pub fn password_config(host: &str) -> ConnectionConfig {
    ConnectionConfig::new(
        host,
        "tester",
        AuthMethod::Password {
            password: "secret".to_string(),
        },
    )
}

#[derive(Debug, Default)]
struct RemoteFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl RemoteFs {
    fn new() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    fn children(&self, dir: &str) -> Vec<DirEntry> {
        let name = |path: &str| path.rsplit('/').next().unwrap_or(path).to_string();
        let dirs = self
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && parent_path(d) == dir)
            .map(|d| DirEntry::new(name(d), FileType::Directory));
        let files = self
            .files
            .keys()
            .filter(|f| parent_path(f) == dir)
            .map(|f| DirEntry::new(name(f), FileType::File));
        dirs.chain(files).collect()
    }
}

#[derive(Default)]
struct Script {
    handshake_failures: VecDeque<RawError>,
    handshake_delay: Duration,
    exec_failures: VecDeque<RawError>,
    fs_failures: VecDeque<RawError>,
    close_failures: VecDeque<RawError>,
    executed: Vec<String>,
}

struct Shared {
    fs: Mutex<RemoteFs>,
    script: Mutex<Script>,
    handshakes: AtomicUsize,
    closes: AtomicUsize,
    fs_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedRemote {
    shared: Arc<Shared>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                fs: Mutex::new(RemoteFs::new()),
                script: Mutex::new(Script::default()),
                handshakes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fs_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// The next handshakes fail with these errors, in order.
    pub fn fail_handshakes(&self, errors: impl IntoIterator<Item = RawError>) {
        self.shared.script.lock().handshake_failures.extend(errors);
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        self.shared.script.lock().handshake_delay = delay;
    }

    pub fn fail_next_exec(&self, error: RawError) {
        self.shared.script.lock().exec_failures.push_back(error);
    }

    pub fn fail_next_fs(&self, error: RawError) {
        self.shared.script.lock().fs_failures.push_back(error);
    }

    pub fn fail_next_close(&self, error: RawError) {
        self.shared.script.lock().close_failures.push_back(error);
    }

    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn fs_calls(&self) -> usize {
        self.shared.fs_calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.shared.script.lock().executed.clone()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.shared
            .fs
            .lock()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        self.shared.fs.lock().dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.fs.lock().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.shared.fs.lock().dirs.contains(path)
    }
}

#[async_trait]
impl Connector for ScriptedRemote {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, RawError> {
        self.shared.handshakes.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let mut script = self.shared.script.lock();
            (script.handshake_delay, script.handshake_failures.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            tracing::debug!("scripted handshake to {} fails: {}", config.endpoint(), err);
            return Err(err);
        }
        Ok(Box::new(ScriptedTransport {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, command: &str) -> Result<CommandOutput, RawError> {
        let mut script = self.shared.script.lock();
        if let Some(err) = script.exec_failures.pop_front() {
            return Err(err);
        }
        script.executed.push(command.to_string());
        let stdout = command
            .strip_prefix("echo ")
            .map(|s| format!("{}\n", s.trim_matches('"')))
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            ..Default::default()
        })
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>, RawError> {
        Ok(Box::new(ScriptedFiles {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn open_shell(&self, _request: &ShellRequest) -> Result<Box<dyn ShellChannel>, RawError> {
        let (local, _remote) = tokio::io::duplex(1024);
        Ok(Box::new(local))
    }

    async fn close(&self) -> Result<(), RawError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        match self.shared.script.lock().close_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct ScriptedFiles {
    shared: Arc<Shared>,
}

impl ScriptedFiles {
    fn with_fs<T>(&self, f: impl FnOnce(&mut RemoteFs) -> Result<T, RawError>) -> Result<T, RawError> {
        self.shared.fs_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.shared.script.lock().fs_failures.pop_front() {
            return Err(err);
        }
        f(&mut self.shared.fs.lock())
    }
}

#[async_trait]
impl FileChannel for ScriptedFiles {
    async fn stat(&self, path: &str) -> Result<FileStat, RawError> {
        self.with_fs(|fs| {
            if fs.dirs.contains(path) {
                Ok(FileStat::directory(0o755))
            } else if let Some(content) = fs.files.get(path) {
                Ok(FileStat::file(content.len() as u64, 0o644))
            } else {
                Err(not_found(path))
            }
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RawError> {
        self.with_fs(|fs| {
            if fs.dirs.contains(path) {
                Ok(fs.children(path))
            } else {
                Err(not_found(path))
            }
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, RawError> {
        self.with_fs(|fs| fs.files.get(path).cloned().ok_or_else(|| not_found(path)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), RawError> {
        self.with_fs(|fs| {
            if !fs.dirs.contains(&parent_path(path)) {
                return Err(not_found(path));
            }
            fs.files.insert(path.to_string(), data.to_vec());
            Ok(())
        })
    }

    async fn remove(&self, path: &str) -> Result<(), RawError> {
        self.with_fs(|fs| fs.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path)))
    }

    async fn mkdir(&self, path: &str) -> Result<(), RawError> {
        self.with_fs(|fs| {
            if fs.dirs.contains(path) || fs.files.contains_key(path) {
                return Err(RawError::with_code(format!("File exists: {}", path), "EEXIST"));
            }
            fs.dirs.insert(path.to_string());
            Ok(())
        })
    }

    async fn rmdir(&self, path: &str) -> Result<(), RawError> {
        self.with_fs(|fs| {
            if !fs.dirs.contains(path) {
                return Err(not_found(path));
            }
            if !fs.children(path).is_empty() {
                return Err(RawError::with_code(
                    format!("Directory not empty: {}", path),
                    "ENOTEMPTY",
                ));
            }
            fs.dirs.remove(path);
            Ok(())
        })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RawError> {
        self.with_fs(|fs| {
            if let Some(content) = fs.files.remove(from) {
                fs.files.insert(to.to_string(), content);
                Ok(())
            } else if fs.dirs.remove(from) {
                fs.dirs.insert(to.to_string());
                Ok(())
            } else {
                Err(not_found(from))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_handshake_failures_are_consumed_in_order() {
        let remote = ScriptedRemote::new();
        remote.fail_handshakes([network_error(), auth_error()]);
        let config = password_config("h");

        let first = remote.open(&config).await.err().map(|e| e.message);
        let second = remote.open(&config).await.err().map(|e| e.message);
        assert_eq!(first.as_deref(), Some("read ECONNRESET"));
        assert_eq!(
            second.as_deref(),
            Some("All configured authentication methods failed")
        );
        assert!(remote.open(&config).await.is_ok());
        assert_eq!(remote.handshakes(), 3);
    }

    #[tokio::test]
    async fn test_scripted_filesystem() {
        let remote = ScriptedRemote::new();
        let transport = remote.open(&password_config("h")).await.unwrap();
        let files = transport.open_file_channel().await.unwrap();

        files.mkdir("/data").await.unwrap();
        files.write("/data/a.txt", b"abc").await.unwrap();
        assert_eq!(files.read("/data/a.txt").await.unwrap(), b"abc");
        assert_eq!(files.stat("/data/a.txt").await.unwrap().size, 3);
        assert!(files.stat("/data").await.unwrap().is_dir());

        let listing = files.read_dir("/data").await.unwrap();
        assert_eq!(listing, vec![DirEntry::new("a.txt", FileType::File)]);

        let err = files.rmdir("/data").await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ENOTEMPTY"));

        files.rename("/data/a.txt", "/data/b.txt").await.unwrap();
        assert!(remote.file("/data/a.txt").is_none());
        files.remove("/data/b.txt").await.unwrap();
        files.rmdir("/data").await.unwrap();
        assert!(!remote.has_dir("/data"));
        assert!(files.write("/missing/x", b"").await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_exec_echoes() {
        let remote = ScriptedRemote::new();
        let transport = remote.open(&password_config("h")).await.unwrap();
        let out = transport.execute("echo \"health_check\"").await.unwrap();
        assert_eq!(out.stdout, "health_check\n");

        remote.fail_next_exec(network_error());
        assert!(transport.execute("ls").await.is_err());
        assert_eq!(remote.executed(), vec!["echo \"health_check\"".to_string()]);
    }
}

//! Record store backed by a JSON document on the local filesystem

use super::{ClusterRecordStore, Records};
use crate::error::Result;
use crate::types::{ClusterId, ClusterRecord, NodeId, NodeRecord, NodeStatus, TaskStatus};
use nix::fcntl::{flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive advisory lock on the store's lock file, released on drop
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(std::io::Error::from)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(error = %e, "failed to release record store lock");
        }
    }
}

/// JSON file record store
///
/// Every operation reads, and if needed rewrites, the whole document while
/// holding an exclusive `flock` on a sibling `.lock` file. Several processes
/// (an orchestrating CLI and guests reporting status) can therefore share one
/// store, and `begin_task` is an atomic compare-and-set on the task status.
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    /// Open the store at `path`, creating an empty document if missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        let store = Self {
            path,
            lock_path: PathBuf::from(lock_name),
        };

        let _lock = FileLock::acquire(&store.lock_path)?;
        if !store.path.exists() {
            debug!(path = %store.path.display(), "creating empty record store");
            store.save(&Records::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load records; caller holds the lock
    fn load(&self) -> Result<Records> {
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Records::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Save records through a rename; caller holds the lock
    fn save(&self, records: &Records) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Records) -> Result<T>) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let records = self.load()?;
        f(&records)
    }

    fn update<T>(&self, f: impl FnOnce(&mut Records) -> Result<T>) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut records = self.load()?;
        let out = f(&mut records)?;
        self.save(&records)?;
        Ok(out)
    }
}

impl ClusterRecordStore for JsonFileStore {
    fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        self.read(|r| Ok(r.list_clusters()))
    }

    fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord> {
        self.read(|r| r.get_cluster(id))
    }

    fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<NodeRecord>> {
        self.read(|r| r.list_nodes(cluster))
    }

    fn get_node(&self, id: NodeId) -> Result<NodeRecord> {
        self.read(|r| r.get_node(id))
    }

    fn insert_cluster(&self, cluster: &ClusterRecord) -> Result<()> {
        self.update(|r| r.insert_cluster(cluster))
    }

    fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        self.update(|r| r.delete_cluster(id))
    }

    fn begin_task(&self, id: ClusterId, task: TaskStatus) -> Result<ClusterRecord> {
        self.update(|r| r.begin_task(id, task))
    }

    fn set_task_status(&self, id: ClusterId, task: TaskStatus) -> Result<()> {
        self.update(|r| r.set_task_status(id, task))
    }

    fn set_datastore_version(&self, id: ClusterId, version: &str) -> Result<()> {
        self.update(|r| r.set_datastore_version(id, version))
    }

    fn insert_node(&self, node: &NodeRecord) -> Result<()> {
        self.update(|r| r.insert_node(node))
    }

    fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<()> {
        self.update(|r| r.set_node_status(id, status))
    }

    fn set_node_address(&self, id: NodeId, ip: &str) -> Result<()> {
        self.update(|r| r.set_node_address(id, ip))
    }

    fn detach_node(&self, id: NodeId) -> Result<()> {
        self.update(|r| r.detach_node(id))
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        self.update(|r| r.delete_node(id))
    }
}

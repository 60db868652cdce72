//! Per-node snapshot files.
//!
//! Layout: `<root>/<node id>/<seq>-<term>-<index>.json`, zero padded. `seq`
//! grows by one per write to a node's directory, so a lexical sort is the
//! write order even when a restarted node snapshots at a lower term and
//! index than its previous life. Only the newest `retain` files survive a
//! write.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::store::StateSnapshot;
use crate::topology::NodeId;

const SNAPSHOT_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            root: root.into(),
            retain: retain.max(1),
        }
    }

    /// Wipes and recreates the root directory. Run once at startup.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove snapshot directory {}", self.root.display())
                })
            }
        }
        fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create snapshot directory {}", self.root.display())
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self, id: NodeId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Writes a snapshot taken at (`term`, `index`) and prunes older ones.
    pub fn persist(
        &self,
        id: NodeId,
        term: u64,
        index: u64,
        snapshot: &StateSnapshot,
    ) -> Result<PathBuf> {
        let dir = self.node_dir(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let seq = self.next_sequence(id)?;
        let name = format!("{seq:010}-{term:020}-{index:020}.{SNAPSHOT_EXT}");
        let path = dir.join(&name);
        let tmp = dir.join(format!("{name}.tmp"));

        let bytes = snapshot.encode().context("failed to encode snapshot")?;
        fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to finalize {}", path.display()))?;

        self.prune(&dir)?;
        debug!(node_id = %id, path = %path.display(), "snapshot persisted");
        Ok(path)
    }

    /// Snapshot files for a node, oldest first.
    pub fn list(&self, id: NodeId) -> Result<Vec<PathBuf>> {
        let dir = self.node_dir(id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Raw bytes of the newest snapshot, if any.
    pub fn latest(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        match self.list(id)?.pop() {
            Some(path) => {
                let bytes =
                    fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// One past the highest sequence number on disk for `id`.
    fn next_sequence(&self, id: NodeId) -> Result<u64> {
        let last = self
            .list(id)?
            .iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                stem.split('-').next()?.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0);
        Ok(last + 1)
    }

    fn prune(&self, dir: &Path) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT))
            .collect();
        files.sort();
        let excess = files.len().saturating_sub(self.retain);
        for stale in files.into_iter().take(excess) {
            fs::remove_file(&stale)
                .with_context(|| format!("failed to remove {}", stale.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn snapshot_with(node: u64, pairs: &[(&str, &str)]) -> StateSnapshot {
        StateSnapshot {
            store: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            node_id: NodeId::new(node),
        }
    }

    #[test]
    fn keeps_only_newest_snapshots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path(), 2);
        let node = NodeId::new(1);

        store.persist(node, 1, 3, &snapshot_with(1, &[("a", "1")]))?;
        store.persist(node, 1, 7, &snapshot_with(1, &[("a", "2")]))?;
        store.persist(node, 2, 9, &snapshot_with(1, &[("a", "3")]))?;

        assert_eq!(store.list(node)?.len(), 2);
        let latest = StateSnapshot::decode(&store.latest(node)?.expect("latest snapshot"))?;
        assert_eq!(latest, snapshot_with(1, &[("a", "3")]));
        Ok(())
    }

    #[test]
    fn restarted_node_snapshot_outranks_older_terms() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path(), 2);
        let node = NodeId::new(4);

        store.persist(node, 4, 20, &snapshot_with(4, &[("k", "old1")]))?;
        store.persist(node, 4, 30, &snapshot_with(4, &[("k", "old2")]))?;
        // Clean-slate restart, stopped again before catching up.
        store.persist(node, 0, 0, &snapshot_with(4, &[("k", "newest")]))?;

        let files = store.list(node)?;
        assert_eq!(files.len(), 2);
        let latest = StateSnapshot::decode(&store.latest(node)?.expect("latest snapshot"))?;
        assert_eq!(latest, snapshot_with(4, &[("k", "newest")]));
        let oldest = StateSnapshot::decode(&std::fs::read(&files[0])?)?;
        assert_eq!(oldest, snapshot_with(4, &[("k", "old2")]));
        Ok(())
    }

    #[test]
    fn nodes_have_separate_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path(), 2);
        store.persist(NodeId::new(2), 1, 1, &snapshot_with(2, &[]))?;

        assert!(store.node_dir(NodeId::new(2)).ends_with("node2"));
        assert!(store.latest(NodeId::new(3))?.is_none());
        Ok(())
    }

    #[test]
    fn reset_clears_previous_runs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path().join("snapshots"), 2);
        store.persist(NodeId::new(1), 1, 1, &snapshot_with(1, &[("k", "v")]))?;

        store.reset()?;

        assert!(store.root().exists());
        assert!(store.list(NodeId::new(1))?.is_empty());
        Ok(())
    }
}

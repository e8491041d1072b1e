/// Where shares and snapshots live on an appliance.
///
/// ```text
/// <mount_root>/<pool>/<share>                        live share
/// <mount_root>/<pool>/.snapshots/<share>/<snap>      snapshot of that share
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    mount_root: std::path::PathBuf,
}

impl Layout {
    pub fn new(mount_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }

    pub fn share_path(&self, pool: &str, share: &str) -> std::path::PathBuf {
        self.mount_root.join(pool).join(share)
    }

    pub fn snapshot_dir(&self, pool: &str, share: &str) -> std::path::PathBuf {
        self.mount_root.join(pool).join(".snapshots").join(share)
    }

    pub fn snapshot_path(&self, pool: &str, share: &str, snap: &str) -> std::path::PathBuf {
        self.snapshot_dir(pool, share).join(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_pool_layout() {
        let layout = Layout::new("/mnt2");
        assert_eq!(
            layout.share_path("pool0", "vol1"),
            std::path::PathBuf::from("/mnt2/pool0/vol1")
        );
        assert_eq!(
            layout.snapshot_path("pool0", "vol1", "vol1_7_replication_1"),
            std::path::PathBuf::from("/mnt2/pool0/.snapshots/vol1/vol1_7_replication_1")
        );
    }
}

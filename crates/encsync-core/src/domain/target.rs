//! Target records
//!
//! A target is a directed pair of folders plus the flags of one run.

use serde::{Deserialize, Serialize};

use super::folder::Folder;

/// Per-run flags of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFlags {
    pub skip_integrity_check: bool,
    pub no_remove: bool,
    pub enable_scan: bool,
    /// Overrides the source folder's `avoid_rescan` when set
    pub avoid_src_rescan: Option<bool>,
    /// Overrides the destination folder's `avoid_rescan` when set
    pub avoid_dst_rescan: Option<bool>,
    /// Bytes per second, `None` for unlimited
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
}

impl Default for TargetFlags {
    fn default() -> Self {
        Self {
            skip_integrity_check: false,
            no_remove: false,
            enable_scan: true,
            avoid_src_rescan: None,
            avoid_dst_rescan: None,
            upload_limit: None,
            download_limit: None,
        }
    }
}

/// A synchronization direction between two folders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub src: Folder,
    pub dst: Folder,
    #[serde(default)]
    pub flags: TargetFlags,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>, src: Folder, dst: Folder) -> Self {
        Self {
            name: name.into(),
            src,
            dst,
            flags: TargetFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: TargetFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Effective rescan avoidance for the source. The target flag wins.
    pub fn avoid_src_rescan(&self) -> bool {
        self.flags.avoid_src_rescan.unwrap_or(self.src.avoid_rescan)
    }

    /// Effective rescan avoidance for the destination. The target flag wins.
    pub fn avoid_dst_rescan(&self) -> bool {
        self.flags.avoid_dst_rescan.unwrap_or(self.dst.avoid_rescan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_flag_overrides_folder_default() {
        let src = Folder::new("src", "local", "/s").with_avoid_rescan(true);
        let dst = Folder::new("dst", "remote", "/d");
        let mut target = TargetSpec::new("t", src, dst);

        assert!(target.avoid_src_rescan());
        assert!(!target.avoid_dst_rescan());

        target.flags.avoid_src_rescan = Some(false);
        target.flags.avoid_dst_rescan = Some(true);
        assert!(!target.avoid_src_rescan());
        assert!(target.avoid_dst_rescan());
    }

    #[test]
    fn scan_is_enabled_by_default() {
        assert!(TargetFlags::default().enable_scan);
    }
}

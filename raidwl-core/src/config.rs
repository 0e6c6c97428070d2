// vim: tw=80
//! Group configuration, as loaded from YAML

use crate::types::*;
use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};

fn default_element_size() -> u64 { 128 }
fn default_alignment() -> u64 { 1 }
fn default_slot_count() -> u32 { 32 }
fn default_drive_blocks() -> u64 { 1 << 20 }
fn default_buffer_blocks() -> u64 { 1 << 14 }
fn default_max_retries() -> u32 { 3 }

/// Everything needed to build a `RaidGeometry` and the resources around it.
///
/// A minimal config only names the width and the parity count:
///
/// ```yaml
/// width: 5
/// parity: 1
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Number of member positions, including parity
    pub width: u16,
    /// Number of parity positions per row: 1 (RAID-5) or 2 (RAID-6)
    pub parity: u16,
    /// Blocks per position per stripe row
    #[serde(default = "default_element_size")]
    pub element_size: u64,
    /// Physical alignment unit, in blocks.  1 means no alignment required.
    #[serde(default = "default_alignment")]
    pub alignment: u64,
    /// Number of write log slots
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Capacity of every member drive, in blocks.  The write log lives at
    /// the end.
    #[serde(default = "default_drive_blocks")]
    pub drive_blocks: u64,
    /// Total buffer space available to in-flight requests, in blocks
    #[serde(default = "default_buffer_blocks")]
    pub buffer_blocks: u64,
    /// How many times a retryable drive error is retried before the
    /// position is treated as dead
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl GroupConfig {
    pub fn new(width: u16, parity: u16) -> Self {
        GroupConfig {
            width,
            parity,
            element_size: default_element_size(),
            alignment: default_alignment(),
            slot_count: default_slot_count(),
            drive_blocks: default_drive_blocks(),
            buffer_blocks: default_buffer_blocks(),
            max_retries: default_max_retries(),
        }
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let cfg: GroupConfig = serde_yaml_ng::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(|_| Error::InvalidConfig)?;
        Self::from_yaml(&s)
    }

    /// Reject configurations that cannot describe a working group.
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.parity) {
            return Err(Error::InvalidGeometry);
        }
        if self.width < self.parity + 2 || self.width as usize > MAX_WIDTH {
            return Err(Error::InvalidGeometry);
        }
        if self.element_size == 0 || self.alignment == 0 ||
            self.element_size % self.alignment != 0
        {
            return Err(Error::InvalidGeometry);
        }
        if self.slot_count == 0 || self.buffer_blocks == 0 {
            return Err(Error::InvalidConfig);
        }
        let log_blocks = (self.element_size + 1)
            .checked_mul(u64::from(self.slot_count))
            .ok_or(Error::InvalidConfig)?;
        if log_blocks + self.element_size > self.drive_blocks {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = GroupConfig::from_yaml("width: 5\nparity: 1\n").unwrap();
        assert_eq!(cfg, GroupConfig::new(5, 1));
        assert_eq!(cfg.element_size, 128);
        assert_eq!(cfg.slot_count, 32);
    }

    #[test]
    fn full() {
        let s = "width: 6\nparity: 2\nelement_size: 64\nalignment: 8\n\
                 slot_count: 4\ndrive_blocks: 4096\nbuffer_blocks: 512\n\
                 max_retries: 1\n";
        let cfg = GroupConfig::from_yaml(s).unwrap();
        assert_eq!(cfg.alignment, 8);
        assert_eq!(cfg.max_retries, 1);
    }

    #[test]
    fn unknown_field() {
        let s = "width: 5\nparity: 1\nstripe_width: 3\n";
        assert_eq!(GroupConfig::from_yaml(s), Err(Error::InvalidConfig));
    }

    #[test]
    fn invalid_parity() {
        assert_eq!(GroupConfig::new(5, 3).validate(),
                   Err(Error::InvalidGeometry));
    }

    #[test]
    fn too_narrow() {
        assert_eq!(GroupConfig::new(3, 2).validate(),
                   Err(Error::InvalidGeometry));
    }

    #[test]
    fn misaligned_element() {
        let mut cfg = GroupConfig::new(5, 1);
        cfg.alignment = 3;
        assert_eq!(cfg.validate(), Err(Error::InvalidGeometry));
    }

    #[test]
    fn load() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"width: 4\nparity: 2\nslot_count: 8\n").unwrap();
        let cfg = GroupConfig::load(f.path()).unwrap();
        assert_eq!(cfg.width, 4);
        assert_eq!(cfg.parity, 2);
        assert_eq!(cfg.slot_count, 8);
    }

    #[test]
    fn load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.yaml");
        assert_eq!(GroupConfig::load(path), Err(Error::InvalidConfig));
    }

    #[test]
    fn log_does_not_fit() {
        let mut cfg = GroupConfig::new(5, 1);
        cfg.drive_blocks = 1000;
        assert_eq!(cfg.validate(), Err(Error::InvalidConfig));
    }
}
// LCOV_EXCL_STOP

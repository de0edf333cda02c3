use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Result, VmError};

/// How the reclaimer treats pages hinted `AlwaysNeed`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Hinted pages are rotated to the most-recently-used end instead of evicted.
    #[default]
    FollowHints,
    /// Hints are ignored and hinted pages are evicted like any other clean page.
    IgnoreAlwaysNeed,
}

/// Engine-wide configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Whether anonymous pages may be compressed when a compressor is present.
    pub compression_enabled: bool,
    /// Whether pages supplied by a page source may come from loaned memory.
    pub supply_loaned: bool,
    /// Maximum pages covered by one read request.
    pub read_ahead_pages: u64,
    /// Candidates pulled from the page queues per reclaim batch.
    pub reclaim_batch: usize,
    /// Default always-need policy for background reclamation.
    pub eviction_policy: EvictionPolicy,
    /// Maximum number of ancestors a clone may have.
    pub max_depth: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            supply_loaned: false,
            read_ahead_pages: 16,
            reclaim_batch: 32,
            eviction_policy: EvictionPolicy::FollowHints,
            max_depth: 256,
        }
    }
}

impl VmOptions {
    /// Parses options from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: VmOptions =
            toml::from_str(text).map_err(|err| VmError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| VmError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.read_ahead_pages == 0 {
            return Err(VmError::Config("read_ahead_pages must be at least 1".into()));
        }
        if self.reclaim_batch == 0 {
            return Err(VmError::Config("reclaim_batch must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(VmError::Config("max_depth must be at least 1".into()));
        }
        Ok(())
    }

    /// Enables or disables compression of anonymous pages.
    pub fn compression_enabled(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Allows supplied pager pages to use loaned memory.
    pub fn supply_loaned(mut self, enabled: bool) -> Self {
        self.supply_loaned = enabled;
        self
    }

    /// Sets the read-ahead window in pages.
    pub fn read_ahead_pages(mut self, pages: u64) -> Self {
        self.read_ahead_pages = pages.max(1);
        self
    }

    /// Sets the reclaim batch size.
    pub fn reclaim_batch(mut self, pages: usize) -> Self {
        self.reclaim_batch = pages.max(1);
        self
    }

    /// Sets the default always-need policy.
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Caps hierarchy depth.
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth.max(1);
        self
    }
}

/// Per-object creation flags.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateOptions {
    /// The object may change size after creation.
    pub resizable: bool,
    /// The object opts into whole-object discard.
    pub discardable: bool,
}

impl CreateOptions {
    /// Fixed-size, non-discardable object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the object resizable.
    pub fn resizable(mut self) -> Self {
        self.resizable = true;
        self
    }

    /// Marks the object discardable.
    pub fn discardable(mut self) -> Self {
        self.discardable = true;
        self
    }
}

//! Isolator configuration collaborator
//!
//! Reads the external `isolate` tool's own INI-like config file (`box_root`,
//! `num_boxes`) once and memoizes it for the lifetime of the process. Mirrors
//! the "first call computes and memoizes" idiom the teacher uses for its own
//! `SANDBOX_CONFIG` static, just pointed at the isolator's config instead of
//! an app-level one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::warn;

use crate::error::IsolateError;
use crate::BoxId;

/// Default location of isolate's config file on Debian-family hosts.
const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/isolate";

/// Parsed isolator configuration.
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Filesystem root containing per-box subdirectories.
    pub box_root: PathBuf,
    /// Number of box slots the isolator was built/configured for.
    pub num_boxes: u32,
}

impl IsolateConfig {
    /// Path to the working directory of `box_id`'s box (`<box_root>/<id>/box`),
    /// computed without consulting the isolator. Only valid for explicit-mode
    /// acquisitions; auto-allocation gets its path from isolate's own stdout.
    pub fn work_dir(&self, box_id: BoxId) -> PathBuf {
        self.box_root.join(box_id.to_string()).join("box")
    }

    /// Path to the box's own directory (`<box_root>/<id>`), parent of `box/`.
    pub fn box_dir(&self, box_id: BoxId) -> PathBuf {
        self.box_root.join(box_id.to_string())
    }

    fn parse(content: &str) -> Result<Self, IsolateError> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let box_root = fields
            .get("box_root")
            .ok_or_else(|| IsolateError::Config("missing box_root".to_string()))?;
        let num_boxes = fields
            .get("num_boxes")
            .ok_or_else(|| IsolateError::Config("missing num_boxes".to_string()))?
            .parse::<u32>()
            .map_err(|e| IsolateError::Config(format!("invalid num_boxes: {e}")))?;

        Ok(Self {
            box_root: PathBuf::from(box_root),
            num_boxes,
        })
    }

    /// Load directly from a given path, bypassing the cache. Mainly useful
    /// for tests that want a fresh config pointed at a temp directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| IsolateError::Config(format!("reading {:?}: {e}", path.as_ref())))?;
        Self::parse(&content)
    }
}

static ISOLATE_CONFIG: OnceLock<IsolateConfig> = OnceLock::new();

/// Returns the process-wide cached isolator configuration, loading it from
/// `ISOLATE_CF` (or [`DEFAULT_CONFIG_PATH`]) on first access.
pub fn get_config() -> &'static IsolateConfig {
    ISOLATE_CONFIG.get_or_init(|| {
        let path = std::env::var("ISOLATE_CF").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        IsolateConfig::load(&path).unwrap_or_else(|e| {
            warn!(
                "failed to load isolate config from {path} ({e}); falling back to defaults"
            );
            IsolateConfig {
                box_root: PathBuf::from("/var/local/lib/isolate"),
                num_boxes: 1000,
            }
        })
    })
}

/// Explicitly initialize the cached config from a given path instead of the
/// default lazy lookup. Errors if the config has already been initialized.
pub fn init_config(path: impl AsRef<Path>) -> Result<(), IsolateError> {
    let config = IsolateConfig::load(path)?;
    ISOLATE_CONFIG
        .set(config)
        .map_err(|_| IsolateError::Config("isolator configuration already initialized".into()))
}

/// Short signal names for the common signals isolate reports via `exitsig`.
/// The source calls libc's `strsignal`; a static table is explicitly called
/// out in the spec as an acceptable substitute.
const SIGNAL_NAMES: &[(i32, &str)] = &[
    (1, "SIGHUP"),
    (2, "SIGINT"),
    (3, "SIGQUIT"),
    (4, "SIGILL"),
    (5, "SIGTRAP"),
    (6, "SIGABRT"),
    (7, "SIGBUS"),
    (8, "SIGFPE"),
    (9, "SIGKILL"),
    (10, "SIGUSR1"),
    (11, "SIGSEGV"),
    (12, "SIGUSR2"),
    (13, "SIGPIPE"),
    (14, "SIGALRM"),
    (15, "SIGTERM"),
    (24, "SIGXCPU"),
    (25, "SIGXFSZ"),
];

/// Looks up a short human-readable name for a signal number, falling back to
/// `Signal N` for anything not in the table.
pub fn signal_name(signal: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|(num, _)| *num == signal)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Signal {signal}"))
}

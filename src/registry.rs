//! Box registry
//!
//! Process-wide mapping from [`BoxId`] to the mutual-exclusion primitive that
//! serializes access to it. Grounded on the teacher's `SANDBOX_CONFIG`/
//! `USE_CGROUPS` "first call wins, memoize on a static" idiom (see
//! `engine::sandbox::config`), generalized from a single cached value to a
//! per-key map and backed by `dashmap` so lookups for distinct boxes never
//! contend with each other.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::BoxId;

/// Mapping from box id to the mutex that serializes acquisition of that box.
///
/// Entries are created on demand and never evicted during process lifetime:
/// two concurrent lookups for the same `BoxId` observe the same `Arc<Mutex<()>>`
/// (same allocation, not just an equal value), which is what makes "only one
/// active acquisition scope per box_id" an invariant rather than a convention.
pub struct BoxRegistry {
    locks: DashMap<BoxId, Arc<Mutex<()>>>,
}

impl BoxRegistry {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Returns the per-box mutex for `box_id`, creating it if this is the
    /// first time it has been requested.
    ///
    /// `DashMap::entry` holds its internal shard lock only for the duration
    /// of this get-or-insert — never across the caller's subsequent
    /// `.lock().await` on the returned mutex, which would otherwise
    /// head-of-line-block lookups for unrelated boxes.
    pub fn get_lock(&self, box_id: BoxId) -> Arc<Mutex<()>> {
        self.locks
            .entry(box_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of boxes that have ever had a lock allocated. Exposed mainly
    /// for tests asserting the registry doesn't leak unbounded entries under
    /// repeated acquisition of the same small set of box ids.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

static GLOBAL_REGISTRY: OnceLock<BoxRegistry> = OnceLock::new();

impl BoxRegistry {
    /// The single process-wide registry instance, lazily constructed on
    /// first access (same singleton idiom as [`crate::config::get_config`]).
    pub fn global() -> &'static BoxRegistry {
        GLOBAL_REGISTRY.get_or_init(BoxRegistry::new)
    }
}

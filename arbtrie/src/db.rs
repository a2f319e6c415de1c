//! The public library surface (§6 "Consumer API"): `Database`, sessions,
//! read locks, write sessions, and the version handles that tie them all
//! together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use tracing::info;

use crate::compactor::Compactor;
use crate::error::{Error, Result};
use crate::meta::ObjectId;
use crate::node::Value;
use crate::options::{Options, SyncMode};
use crate::seg_alloc::{self, SegAllocator};
use crate::store::NodeStore;
use crate::trie::ops;

/// A trie root, or the empty trie. Cheap to copy; every `Version` in
/// circulation holds one reference on its root id (if any) in the id
/// table, matching the "version's root" language in §4.5/§8.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Version(Option<ObjectId>);

impl Version {
    pub fn empty() -> Self {
        Version(None)
    }

    pub fn root(&self) -> Option<ObjectId> {
        self.0
    }
}

/// A resolved trie value, borrowed from the mapped segment for inline
/// values or (for large values) loaded from its own blob object.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ValueView {
    Inline(Vec<u8>),
    Blob(Vec<u8>),
}

impl ValueView {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ValueView::Inline(b) | ValueView::Blob(b) => b,
        }
    }
}

/// Diagnostic counters surfaced by [`Database::stats`] (supplemented
/// feature, not a core §4 component).
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub segment_count: u32,
    pub live_id_count: u64,
    pub read_only: bool,
}

/// An open database directory: the segment file, the id table, and an
/// optional background compactor thread.
pub struct Database {
    seg: Arc<SegAllocator>,
    options: Options,
    compactor: StdMutex<Option<Compactor>>,
    read_only: AtomicBool,
}

impl Database {
    pub fn open(path: impl AsRef<std::path::Path>, options: Options) -> Result<Self> {
        let seg = Arc::new(SegAllocator::open(path, &options)?);
        Ok(Database {
            seg,
            options,
            compactor: StdMutex::new(None),
            read_only: AtomicBool::new(false),
        })
    }

    /// Flush pending writes and stop the compactor. The database handle is
    /// consumed; dropping the returned value unmaps everything.
    pub fn close(self) -> Result<()> {
        self.stop_compact_thread();
        self.sync(SyncMode::MsyncSync)
    }

    pub fn start_session(&self) -> Result<Session<'_>> {
        let region = self.seg.ids.new_region();
        let seg_session = self.seg.start_session()?;
        Ok(Session {
            db: self,
            region,
            seg_session,
        })
    }

    pub fn start_compact_thread(&self) {
        let mut slot = self.compactor.lock().unwrap();
        if slot.is_none() {
            info!("starting compactor thread");
            *slot = Some(Compactor::start(self.seg.clone(), self.options.clone()));
        }
    }

    pub fn stop_compact_thread(&self) {
        let compactor = self.compactor.lock().unwrap().take();
        if let Some(c) = compactor {
            c.stop();
        }
    }

    /// Run a single compaction pass synchronously on the calling thread.
    /// Returns `true` if a segment was found and processed. Useful for
    /// tests and for operators who want to drive compaction manually
    /// instead of (or between runs of) the background thread.
    pub fn compact_now(&self) -> Result<bool> {
        crate::compactor::compact_pass(&self.seg, &self.options)
    }

    pub fn sync(&self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::None => Ok(()),
            SyncMode::MsyncAsync => self.seg.sync(false),
            SyncMode::MsyncSync => self.seg.sync(true),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn mark_poisoned(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            segment_count: self.seg.num_segments(),
            live_id_count: self.seg.ids.count_ids_with_refs(),
            read_only: self.is_read_only(),
        }
    }

    /// Human-readable dump of every key/value reachable from `version`,
    /// for tests and operator debugging (supplemented feature).
    pub fn debug_dump(&self, version: Version) -> Result<String> {
        let store = NodeStore::new(&self.seg);
        let entries = crate::trie::iter::collect(&store, version.root())?;
        let mut out = String::new();
        for (k, v) in entries {
            let resolved = resolve_value(&store, &v)?;
            out.push_str(&format!("{:?} => {:?}\n", k, resolved.as_bytes()));
        }
        Ok(out)
    }

    /// Add one reference to `version`'s root, producing an independent
    /// handle that survives later mutation of the original (§8 "multiple
    /// live versions"). Returns the same empty version unchanged.
    pub fn retain_version(&self, version: Version) -> Result<Version> {
        if let Some(root) = version.0 {
            NodeStore::new(&self.seg).retain(root)?;
        }
        Ok(version)
    }

    /// Drop a version the caller is done with. Cascades exactly like the
    /// internal old-root teardown in `trie::ops` (§8 refcount-conservation
    /// invariant).
    pub fn release_version(&self, version: Version) -> Result<()> {
        if let Some(root) = version.0 {
            NodeStore::new(&self.seg).release(root)?;
        }
        Ok(())
    }
}

fn resolve_value(store: &NodeStore, value: &Value) -> Result<ValueView> {
    match value {
        Value::Inline(b) => Ok(ValueView::Inline(b.clone())),
        Value::Indirect(id) => Ok(ValueView::Blob(store.load_blob(*id)?)),
    }
}

/// A per-thread handle into the database, matching §4.2/§5's session
/// model: readers acquire [`ReadLock`]s from it, writers acquire a
/// [`WriteSession`].
pub struct Session<'db> {
    db: &'db Database,
    region: u16,
    seg_session: seg_alloc::Session<'db>,
}

impl<'db> Session<'db> {
    pub fn lock(&self) -> ReadLock<'db, '_> {
        ReadLock {
            db: self.db,
            _lock: self.seg_session.read_lock(),
        }
    }

    pub fn write_session(&self) -> WriteSession<'db> {
        WriteSession {
            db: self.db,
            region: self.region,
        }
    }
}

/// RAII read-lock: while held, the compactor will not recycle any segment
/// a `get`/iteration under this lock might still be viewing (§5 "session
/// read-lock protocol").
pub struct ReadLock<'db, 's> {
    db: &'db Database,
    _lock: seg_alloc::ReadLock<'db, 's>,
}

impl<'db, 's> ReadLock<'db, 's> {
    pub fn get(&self, version: Version, key: &[u8]) -> Result<Option<ValueView>> {
        let store = NodeStore::new(&self.db.seg);
        match ops::get(&store, version.root(), key)? {
            None => Ok(None),
            Some(v) => Ok(Some(resolve_value(&store, &v)?)),
        }
    }

    /// Forward cursor over every key with the given `prefix`, ordered
    /// lexicographically (§4.5 "Iteration"). Collected eagerly under this
    /// read lock; see `trie::iter`'s doc comment for why.
    pub fn iterator(&self, version: Version, prefix: &[u8]) -> Result<Cursor> {
        let store = NodeStore::new(&self.db.seg);
        let mut entries = crate::trie::iter::collect(&store, version.root())?;
        entries.retain(|(k, _)| k.starts_with(prefix));
        let resolved = entries
            .into_iter()
            .map(|(k, v)| resolve_value(&store, &v).map(|rv| (k, rv)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Cursor {
            entries: resolved,
            pos: 0,
        })
    }
}

/// A forward/backward cursor over a previously collected key range.
pub struct Cursor {
    entries: Vec<(Vec<u8>, ValueView)>,
    pos: usize,
}

impl Cursor {
    pub fn next(&mut self) -> bool {
        if self.pos < self.entries.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn prev(&mut self) -> bool {
        if self.pos > 0 {
            self.pos -= 1;
            true
        } else {
            false
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.entries.get(self.pos.saturating_sub(1)).map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&ValueView> {
        self.entries.get(self.pos.saturating_sub(1)).map(|(_, v)| v)
    }
}

/// Mutating handle into the database. Every call takes the version it
/// read, returning the new version; the caller decides whether that
/// becomes the trie's new "current" head or a retained snapshot.
pub struct WriteSession<'db> {
    db: &'db Database,
    region: u16,
}

impl<'db> WriteSession<'db> {
    pub fn upsert(&self, version: Version, key: &[u8], value: &[u8]) -> Result<Version> {
        if self.db.is_read_only() {
            return Err(Error::Poisoned("database is read-only".to_string()));
        }
        if key.len() > crate::options::MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds MAX_KEY_LEN",
                key.len()
            )));
        }
        let store = NodeStore::new(&self.db.seg);
        let value = if value.len() <= crate::options::MAX_INLINE_VALUE_LEN {
            Value::Inline(value.to_vec())
        } else {
            Value::Indirect(store.store_blob(self.region, value)?)
        };
        let new_root = ops::upsert(&store, self.region, version.root(), key, value)?;
        Ok(Version(Some(new_root)))
    }

    pub fn remove(&self, version: Version, key: &[u8]) -> Result<Version> {
        if self.db.is_read_only() {
            return Err(Error::Poisoned("database is read-only".to_string()));
        }
        let store = NodeStore::new(&self.db.seg);
        let new_root = ops::remove(&store, self.region, version.root(), key)?;
        Ok(Version(new_root))
    }
}

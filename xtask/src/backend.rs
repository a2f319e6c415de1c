//! Backends the benchmark harness can drive: the real engine, and a
//! `BTreeMap` reference used to sanity-check results (§8 invariant 1: "the
//! trie is equivalent to a reference sorted map over the same
//! operations").

use std::collections::BTreeMap;

use arbtrie::{Database, Options, Version};

use crate::timer::Timer;

type Value = Vec<u8>;
type Key = Vec<u8>;

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum Backend {
    Arbtrie,
    ReferenceMap,
}

#[derive(Clone, Debug)]
pub enum Action {
    /// Write into the storage, `None` as value means delete that key.
    Write { key: Key, value: Option<Value> },
    /// Read the storage.
    Read { key: Key },
}

/// Trait implemented by both backends so the harness can drive them
/// identically and diff their read results.
pub trait Db {
    /// Apply the given actions to the storage, committing them to the
    /// database at the end. Returns the bytes read back for every `Read`
    /// action, in order, for cross-backend comparison.
    fn apply_actions(
        &mut self,
        actions: Vec<Action>,
        timer: Option<&mut Timer>,
    ) -> Vec<Option<Vec<u8>>>;
}

impl Backend {
    pub fn all_backends() -> Vec<Self> {
        vec![Backend::Arbtrie, Backend::ReferenceMap]
    }

    /// If `reset` is true, erase any previous backend's database and
    /// restart from an empty one. Otherwise reopen what's there.
    pub fn instantiate(&self, reset: bool, dir: &std::path::Path) -> Box<dyn Db> {
        match self {
            Backend::Arbtrie => Box::new(ArbtrieDb::new(reset, dir)),
            Backend::ReferenceMap => Box::new(ReferenceMapDb::new(reset, dir)),
        }
    }
}

pub struct ArbtrieDb {
    db: Database,
    version: Version,
}

impl ArbtrieDb {
    pub fn new(reset: bool, dir: &std::path::Path) -> Self {
        if reset {
            let _ = std::fs::remove_dir_all(dir);
        }
        let db = Database::open(dir, Options::new()).expect("open arbtrie database");
        ArbtrieDb {
            db,
            version: Version::empty(),
        }
    }
}

impl Db for ArbtrieDb {
    fn apply_actions(
        &mut self,
        actions: Vec<Action>,
        mut timer: Option<&mut Timer>,
    ) -> Vec<Option<Vec<u8>>> {
        let session = self.db.start_session().expect("start session");
        let writer = session.write_session();
        let mut reads = Vec::new();
        for action in actions {
            match action {
                Action::Write { key, value } => {
                    let version = self.version;
                    self.version = match &mut timer {
                        Some(t) => {
                            t.measure("write", || apply_write(&writer, version, &key, value))
                        }
                        None => apply_write(&writer, version, &key, value),
                    };
                }
                Action::Read { key } => {
                    let lock = session.lock();
                    let version = self.version;
                    let result = match &mut timer {
                        Some(t) => t.measure("read", || lock.get(version, &key).expect("read")),
                        None => lock.get(version, &key).expect("read"),
                    };
                    reads.push(result.map(|v| v.as_bytes().to_vec()));
                }
            }
        }
        reads
    }
}

fn apply_write(
    writer: &arbtrie::WriteSession,
    version: Version,
    key: &[u8],
    value: Option<Vec<u8>>,
) -> Version {
    match value {
        Some(v) => writer.upsert(version, key, &v).expect("upsert"),
        None => writer.remove(version, key).expect("remove"),
    }
}

pub struct ReferenceMapDb {
    map: BTreeMap<Key, Value>,
}

impl ReferenceMapDb {
    pub fn new(_reset: bool, _dir: &std::path::Path) -> Self {
        ReferenceMapDb {
            map: BTreeMap::new(),
        }
    }
}

impl Db for ReferenceMapDb {
    fn apply_actions(
        &mut self,
        actions: Vec<Action>,
        mut timer: Option<&mut Timer>,
    ) -> Vec<Option<Vec<u8>>> {
        let mut reads = Vec::new();
        for action in actions {
            match action {
                Action::Write { key, value } => {
                    let map = &mut self.map;
                    match &mut timer {
                        Some(t) => t.measure("write", || apply_write_ref(map, key, value)),
                        None => apply_write_ref(map, key, value),
                    }
                }
                Action::Read { key } => {
                    let map = &self.map;
                    let result = match &mut timer {
                        Some(t) => t.measure("read", || map.get(&key).cloned()),
                        None => map.get(&key).cloned(),
                    };
                    reads.push(result);
                }
            }
        }
        reads
    }
}

fn apply_write_ref(map: &mut BTreeMap<Key, Value>, key: Key, value: Option<Value>) {
    match value {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

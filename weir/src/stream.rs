//! Stream identity and the process-wide name intern table
//!
//! Streams are named logical channels. Internally a stream is identified
//! by a [StreamId], a 64 bit value derived from the name with a fixed
//! hash, stable for the lifetime of a run. Two ids are reserved: the
//! wildcard id ("any stream") and the invalid id (hash of the empty
//! name). The name table is append-only; the common path takes the read
//! lock only.
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::RwLock;

/// Name of the wildcard stream.
pub const WILDCARD_STREAM: &str = "*";

/// Numeric identity of a stream, derived from its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Derives the id for a stream name. The hash is fixed and unseeded,
    /// so the mapping is stable within a run.
    pub fn from_name(name: &str) -> StreamId {
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write(name.as_bytes());
        StreamId(hasher.finish())
    }

    /// The reserved "any stream" id.
    pub fn wildcard() -> StreamId {
        StreamId::from_name(WILDCARD_STREAM)
    }

    /// The reserved id of the empty name, used for unrouted messages.
    pub fn invalid() -> StreamId {
        StreamId::from_name("")
    }

    /// True for the wildcard id.
    pub fn is_wildcard(&self) -> bool {
        *self == StreamId::wildcard()
    }

    /// Raw hash value, for logging.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Default)]
struct Tables {
    by_name: FxHashMap<String, StreamId>,
    by_id: FxHashMap<StreamId, String>,
}

/// Append-only intern table mapping stream names to ids and back.
///
/// One instance is created per pipeline and threaded through construction;
/// there is no hidden global.
pub struct StreamNames {
    inner: RwLock<Tables>,
}

impl Default for StreamNames {
    fn default() -> Self {
        StreamNames::new()
    }
}

impl StreamNames {
    /// Creates a table with the two reserved streams pre-interned.
    pub fn new() -> Self {
        let names = StreamNames {
            inner: RwLock::new(Tables::default()),
        };
        let _ = names.intern(WILDCARD_STREAM);
        let _ = names.intern("");
        names
    }

    /// Returns the id for `name`, interning it on first use.
    pub fn intern(&self, name: &str) -> StreamId {
        if let Ok(tables) = self.inner.read() {
            if let Some(id) = tables.by_name.get(name) {
                return *id;
            }
        }
        let id = StreamId::from_name(name);
        if let Ok(mut tables) = self.inner.write() {
            let _ = tables.by_name.insert(name.to_string(), id);
            let _ = tables.by_id.insert(id, name.to_string());
        }
        id
    }

    /// Returns the id for `name` without interning.
    pub fn get(&self, name: &str) -> Option<StreamId> {
        self.inner
            .read()
            .ok()
            .and_then(|tables| tables.by_name.get(name).copied())
    }

    /// Reverse lookup for logging and metadata-driven routing.
    pub fn name_of(&self, id: StreamId) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|tables| tables.by_id.get(&id).cloned())
    }

    /// Names currently interned, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|tables| tables.by_name.keys().cloned().collect())
            .unwrap_or_default()
    }
}

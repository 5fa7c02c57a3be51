//! Server-side statement and portal names, and the prepared statement cache.
use lru::LruCache;
use std::{num::NonZeroUsize, sync::atomic::Ordering};

type AtomicId = std::sync::atomic::AtomicU16;

#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 6]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 6])
    }

    pub(crate) fn next(atomic: &AtomicId) -> Self {
        let id = atomic.fetch_add(1, Ordering::SeqCst);
        let mut buf = [b'q', b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            #[allow(unused, reason = "`PortalName::next` reserved for named portals")]
            pub(crate) fn next() -> Self {
                static ID: AtomicId = AtomicId::new(0);
                Self(Id::next(&ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName);
delegate!(PortalName);

/// One more use of a statement, as decided by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtPlan {
    /// The statement is prepared server-side under this name; skip Parse.
    Cached(StatementName),
    /// The use count crossed the prepare threshold; Parse under this name.
    Prepare(StatementName),
    /// Below the threshold; Parse the unnamed statement.
    Unnamed,
}

struct StmtEntry {
    uses: u32,
    name: Option<StatementName>,
}

/// Per-connection use-counted LRU of prepared statements.
///
/// Statements are keyed by a fingerprint of the trimmed SQL text. A
/// statement starts unnamed; once its use count reaches the prepare
/// threshold it is promoted to a named server-side statement. The cache is
/// bounded; eviction hands the displaced server name back to the caller so
/// a `Close` can be issued, batched with the next `Sync`.
pub(crate) struct StatementCache {
    entries: LruCache<u64, StmtEntry>,
    threshold: u16,
}

impl StatementCache {
    pub fn new(capacity: NonZeroUsize, threshold: u16) -> Self {
        Self {
            entries: LruCache::new(capacity),
            threshold,
        }
    }

    /// Record one use, returning the plan and a displaced server name, if
    /// any, that must be closed.
    pub fn plan(&mut self, sqlid: u64) -> (StmtPlan, Option<StatementName>) {
        // zero threshold disables server-side preparation entirely
        if self.threshold == 0 {
            return (StmtPlan::Unnamed, None);
        }

        if let Some(entry) = self.entries.get_mut(&sqlid) {
            entry.uses += 1;
            let plan = match &entry.name {
                Some(name) => StmtPlan::Cached(name.clone()),
                None if entry.uses >= self.threshold as u32 => {
                    StmtPlan::Prepare(StatementName::next())
                }
                None => StmtPlan::Unnamed,
            };
            return (plan, None);
        }

        let plan = match self.threshold {
            1 => StmtPlan::Prepare(StatementName::next()),
            _ => StmtPlan::Unnamed,
        };
        let evicted = self
            .entries
            .push(sqlid, StmtEntry { uses: 1, name: None })
            .and_then(|(_, entry)| entry.name);
        (plan, evicted)
    }

    /// Record a server-acknowledged named Parse.
    ///
    /// The cache never holds two entries with the same server name: names
    /// are generated from a process-wide sequence and recorded exactly once
    /// here, after ParseComplete.
    pub fn prepared(&mut self, sqlid: u64, name: StatementName) {
        if let Some(entry) = self.entries.get_mut(&sqlid) {
            entry.name = Some(name);
        }
    }

    #[cfg(test)]
    pub fn contains_named(&self, sqlid: u64) -> bool {
        self.entries.peek(&sqlid).is_some_and(|e| e.name.is_some())
    }
}

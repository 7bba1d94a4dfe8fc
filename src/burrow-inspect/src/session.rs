//! Session identity, dense interning and per-session timestamp storage.

use std::collections::HashMap;
use std::fmt;

/// Opaque printable identifier of one traffic session (a TCP/TLS
/// connection). Ordering is lexicographic; wrapping the string keeps raw
/// strings from being mixed into matrix keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Injective map session id → dense co-occurrence id, assigned from 1.
/// 0 is never used as an id. Insertion-only.
#[derive(Debug, Clone)]
pub struct SessionIndex {
    ids: HashMap<SessionId, u64>,
    next_id: u64,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    /// Return the session's id, assigning the next free one on first use.
    pub fn intern(&mut self, sid: &SessionId) -> u64 {
        if let Some(&cid) = self.ids.get(sid) {
            return cid;
        }
        let cid = self.next_id;
        self.next_id += 1;
        self.ids.insert(sid.clone(), cid);
        cid
    }

    /// Non-assigning lookup.
    pub fn get(&self, sid: &SessionId) -> Option<u64> {
        self.ids.get(sid).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, u64)> {
        self.ids.iter().map(|(sid, &cid)| (sid, cid))
    }

    /// Install a preassigned mapping (codec load path). Fails on the
    /// reserved id 0 or a sid that is already mapped; the caller is
    /// responsible for cid uniqueness across the batch.
    pub(crate) fn insert_assigned(&mut self, sid: SessionId, cid: u64) -> bool {
        if cid == 0 || self.ids.contains_key(&sid) {
            return false;
        }
        self.ids.insert(sid, cid);
        self.next_id = self.next_id.max(cid + 1);
        true
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session timestamp lists, nanoseconds since the capture epoch.
///
/// Lists are kept nondecreasing: out-of-order input is sorted on insert,
/// since the sweep kernels are undefined on unsorted data.
#[derive(Debug, Clone, Default)]
pub struct TimestampStore {
    sessions: HashMap<SessionId, Vec<u64>>,
}

impl TimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a session's timestamps.
    pub fn insert(&mut self, sid: SessionId, mut times: Vec<u64>) {
        if times.windows(2).any(|w| w[0] > w[1]) {
            times.sort_unstable();
        }
        self.sessions.insert(sid, times);
    }

    pub fn get(&self, sid: &SessionId) -> Option<&[u64]> {
        self.sessions.get(sid).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &[u64])> {
        self.sessions.iter().map(|(sid, times)| (sid, times.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Earliest timestamp across all sessions, if any.
    pub fn earliest(&self) -> Option<u64> {
        self.sessions
            .values()
            .filter_map(|times| times.first().copied())
            .min()
    }
}

//! On-disk protobuf form of the co-occurrence matrix and timestamp lists.
//!
//! The container is plain protobuf wire format: repeated outer records
//! (matrix rows), repeated sid records (the id mapping), no header and no
//! checksum. Entry order is not part of the contract; loading tolerates any
//! permutation, rejects conflicting sid↔cid assignments and warns about
//! matrix ids with no sid entry.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use prost::Message;
use thiserror::Error;
use tracing::warn;

use crate::matrix::CoOccurrence;
use crate::session::{SessionId, SessionIndex, TimestampStore};

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode data: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

#[derive(Clone, PartialEq, Message)]
pub struct CoocInner {
    #[prost(uint64, tag = "1")]
    pub cid: u64,
    #[prost(uint64, tag = "2")]
    pub overlap: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CoocOuter {
    #[prost(uint64, tag = "1")]
    pub cid: u64,
    #[prost(message, repeated, tag = "2")]
    pub inner: Vec<CoocInner>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CoocSid {
    #[prost(string, tag = "1")]
    pub sid: String,
    #[prost(uint64, tag = "2")]
    pub cid: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CoocFile {
    #[prost(message, repeated, tag = "1")]
    pub outer: Vec<CoocOuter>,
    #[prost(message, repeated, tag = "2")]
    pub sids: Vec<CoocSid>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimesRecord {
    #[prost(string, tag = "1")]
    pub sid: String,
    #[prost(uint64, repeated, tag = "2")]
    pub times: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimesFile {
    #[prost(message, repeated, tag = "1")]
    pub times: Vec<TimesRecord>,
}

impl CoOccurrence {
    /// Persist the matrix and its id mapping.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InspectError> {
        let mut outer: Vec<CoocOuter> = self
            .data()
            .iter()
            .map(|(&cid, inner_map)| {
                let mut inner: Vec<CoocInner> = inner_map
                    .iter()
                    .map(|(&cid, &overlap)| CoocInner { cid, overlap })
                    .collect();
                inner.sort_unstable_by_key(|entry| entry.cid);
                CoocOuter { cid, inner }
            })
            .collect();
        outer.sort_unstable_by_key(|entry| entry.cid);

        let mut sids: Vec<CoocSid> = self
            .index()
            .iter()
            .map(|(sid, cid)| CoocSid {
                sid: sid.as_str().to_owned(),
                cid,
            })
            .collect();
        sids.sort_unstable_by_key(|entry| entry.cid);

        let file = CoocFile { outer, sids };
        fs::write(path, file.encode_to_vec())?;
        Ok(())
    }

    /// Load a matrix persisted with [`CoOccurrence::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InspectError> {
        let raw = fs::read(path)?;
        let file = CoocFile::decode(raw.as_slice())?;

        let mut index = SessionIndex::new();
        let mut known_cids = HashSet::new();
        for record in &file.sids {
            if !known_cids.insert(record.cid) {
                return Err(InspectError::Corrupt(format!(
                    "cid {} is assigned to more than one session id",
                    record.cid
                )));
            }
            if !index.insert_assigned(SessionId::from(record.sid.as_str()), record.cid) {
                return Err(InspectError::Corrupt(format!(
                    "conflicting mapping for session id {:?} (cid {})",
                    record.sid, record.cid
                )));
            }
        }

        let mut data: HashMap<u64, HashMap<u64, u64>> = HashMap::new();
        let mut unknown_cids = 0usize;
        for outer in &file.outer {
            if !known_cids.contains(&outer.cid) {
                unknown_cids += 1;
            }
            data.entry(outer.cid).or_default();
            for inner in &outer.inner {
                if inner.overlap == 0 || inner.cid == outer.cid {
                    continue; // zero and self cells are never stored
                }
                if !known_cids.contains(&inner.cid) {
                    unknown_cids += 1;
                }
                // normalise so foreign writers cannot break the triangle
                let (i, j) = if outer.cid < inner.cid {
                    (outer.cid, inner.cid)
                } else {
                    (inner.cid, outer.cid)
                };
                data.entry(i).or_default().insert(j, inner.overlap);
            }
        }
        if unknown_cids > 0 {
            warn!(
                count = unknown_cids,
                "matrix references ids missing from the sid table"
            );
        }

        Ok(CoOccurrence::from_parts(data, index))
    }
}

impl TimestampStore {
    /// Persist every session's timestamp list.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InspectError> {
        let mut times: Vec<TimesRecord> = self
            .iter()
            .map(|(sid, times)| TimesRecord {
                sid: sid.as_str().to_owned(),
                times: times.to_vec(),
            })
            .collect();
        times.sort_unstable_by(|a, b| a.sid.cmp(&b.sid));

        let file = TimesFile { times };
        fs::write(path, file.encode_to_vec())?;
        Ok(())
    }

    /// Load timestamp lists persisted with [`TimestampStore::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InspectError> {
        let raw = fs::read(path)?;
        let file = TimesFile::decode(raw.as_slice())?;

        let mut store = TimestampStore::new();
        for record in file.times {
            let sid = SessionId::from(record.sid);
            if store.get(&sid).is_some() {
                return Err(InspectError::Corrupt(format!(
                    "session id {sid} appears more than once"
                )));
            }
            store.insert(sid, record.times);
        }
        Ok(store)
    }
}

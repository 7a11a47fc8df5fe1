// BSD 2-Clause License
//
// Copyright (c) 2024 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The workspace is the only state shared between workers. It lives
//! in a directory so that it can be shared between processes and
//! inspected after a run:
//!
//! ```text
//! states/<id>.state   one record per state image
//! ready/<id>          advertised as ready to run
//! claimed/<id>        claimed by a worker
//! closed/<id>         forked or terminated, holding the final status
//! visited.txt         visited addresses, one per line
//! testcases.jsonl     terminal reports, one JSON object per line
//! assertions.txt      assertion failures as `<address> <state id>`
//! ```
//!
//! Every file that another worker might read is written to a
//! temporary name first and then moved into place, so a partially
//! written record is never visible. A state moves between `ready/`,
//! `claimed/` and `closed/` by renaming its marker, which the
//! filesystem guarantees succeeds for exactly one of several
//! concurrent callers. That rename is the claim operation.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::error::WorkspaceError;
use crate::log;
use crate::report::TerminalReport;
use crate::state::{Address, StateId, StateImage, StateSummary, Status};

const STATES: &str = "states";
const READY: &str = "ready";
const CLAIMED: &str = "claimed";
const CLOSED: &str = "closed";
const VISITED: &str = "visited.txt";
const TESTCASES: &str = "testcases.jsonl";
const ASSERTIONS: &str = "assertions.txt";

const MAGIC: &[u8; 8] = b"SPLKST01";
const HEADER_LEN: usize = 8 + 32;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyState {
    pub id: StateId,
    pub summary: StateSummary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub states: usize,
    pub ready: usize,
    pub claimed: usize,
    pub closed: usize,
}

pub struct Workspace {
    root: PathBuf,
    next_id: AtomicU64,
    summaries: RwLock<HashMap<StateId, StateSummary>>,
    visited: Mutex<File>,
    testcases: Mutex<File>,
    assertions: Mutex<File>,
}

fn encode(image: &StateImage) -> Result<Vec<u8>, WorkspaceError> {
    let payload = bincode::serialize(image)?;
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(MAGIC);
    record.extend_from_slice(&Sha256::digest(&payload));
    record.extend_from_slice(&payload);
    Ok(record)
}

fn decode(id: StateId, record: &[u8]) -> Result<StateImage, WorkspaceError> {
    if record.len() < HEADER_LEN || &record[0..8] != MAGIC {
        return Err(WorkspaceError::Corrupt(format!("state {} has a bad header", id)));
    }
    let payload = &record[HEADER_LEN..];
    if Sha256::digest(payload).as_slice() != &record[8..HEADER_LEN] {
        return Err(WorkspaceError::Corrupt(format!("state {} fails its checksum", id)));
    }
    Ok(bincode::deserialize(payload)?)
}

/// The prefix of a log made of complete lines. A worker that died
/// mid-append can leave a torn final line, which is ignored.
fn complete_lines(contents: &str) -> impl Iterator<Item = &str> {
    let end = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
    contents[..end].lines().filter(|line| !line.trim().is_empty())
}

fn parse_address(word: &str) -> Option<Address> {
    let digits = word.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

fn read_log(path: &Path) -> Result<String, WorkspaceError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn append(log: &Mutex<File>, line: &str, sync: bool) -> Result<(), WorkspaceError> {
    let mut fd = log.lock().map_err(|_| WorkspaceError::Corrupt("log lock poisoned".to_string()))?;
    fd.write_all(line.as_bytes())?;
    if sync {
        fd.sync_data()?
    }
    Ok(())
}

fn count_entries(dir: &Path) -> Result<usize, WorkspaceError> {
    let mut n = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.file_name().to_str().and_then(StateId::parse).is_some() {
            n += 1
        }
    }
    Ok(n)
}

impl Workspace {
    /// Open the workspace in `dir`, creating it if needed. Opening an
    /// existing workspace resumes it: new ids continue above the
    /// highest id already stored.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, WorkspaceError> {
        let root = dir.as_ref().to_path_buf();
        for sub in &[STATES, READY, CLAIMED, CLOSED] {
            fs::create_dir_all(root.join(sub))?
        }

        let mut next_id = 0;
        for entry in fs::read_dir(root.join(STATES))? {
            if let Some(id) = entry?.file_name().to_str().and_then(StateId::parse) {
                next_id = next_id.max(id.as_u64() + 1)
            }
        }

        let open_log = |name: &str| OpenOptions::new().create(true).append(true).open(root.join(name));
        let visited = Mutex::new(open_log(VISITED)?);
        let testcases = Mutex::new(open_log(TESTCASES)?);
        let assertions = Mutex::new(open_log(ASSERTIONS)?);

        log!(log::WORKSPACE, &format!("Opened workspace {} (next id {})", root.display(), next_id));

        Ok(Workspace {
            root,
            next_id: AtomicU64::new(next_id),
            summaries: RwLock::new(HashMap::new()),
            visited,
            testcases,
            assertions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn marker(&self, dir: &str, id: StateId) -> PathBuf {
        self.root.join(dir).join(id.to_string())
    }

    fn record_path(&self, id: StateId) -> PathBuf {
        self.root.join(STATES).join(format!("{}.state", id))
    }

    /// Write `bytes` under `dir/name` so that readers see either no
    /// file or the complete file. With `exclusive` an existing file is
    /// never replaced, and `Ok(false)` is returned instead.
    fn publish(&self, dir: &str, name: &str, bytes: &[u8], exclusive: bool) -> io::Result<bool> {
        let tmp = self.root.join(dir).join(format!(
            ".tmp-{}-{}",
            process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut fd = File::create(&tmp)?;
            fd.write_all(bytes)?;
            fd.sync_all()?;
        }
        let target = self.root.join(dir).join(name);
        if exclusive {
            let linked = fs::hard_link(&tmp, &target);
            fs::remove_file(&tmp)?;
            match linked {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e),
            }
        } else {
            match fs::rename(&tmp, &target) {
                Ok(()) => Ok(true),
                Err(e) => {
                    let _ = fs::remove_file(&tmp);
                    Err(e)
                }
            }
        }
    }

    /// Store an image under a fresh id. If the image is `Ready` it is
    /// advertised in the ready set, but only after its record is on
    /// disk.
    pub fn put(&self, image: &StateImage) -> Result<StateId, WorkspaceError> {
        let mut record = image.clone();
        record.id = None;
        let bytes = encode(&record)?;
        loop {
            let id = StateId::from_u64(self.next_id.fetch_add(1, Ordering::SeqCst));
            if self.publish(STATES, &format!("{}.state", id), &bytes, true)? {
                if record.status == Status::Ready {
                    self.advertise(id, record.summary())?
                }
                log!(log::WORKSPACE, &format!("Stored state {} (parent {:?})", id, image.parent));
                return Ok(id);
            }
            // Another process sharing the directory took this id.
            log!(log::WORKSPACE, &format!("State id {} already in use", id))
        }
    }

    fn advertise(&self, id: StateId, summary: StateSummary) -> Result<(), WorkspaceError> {
        let bytes = bincode::serialize(&summary)?;
        self.publish(READY, &id.to_string(), &bytes, false)?;
        if let Ok(mut summaries) = self.summaries.write() {
            summaries.insert(id, summary);
        }
        Ok(())
    }

    fn load(&self, id: StateId) -> Result<StateImage, WorkspaceError> {
        let record = match fs::read(self.record_path(id)) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(WorkspaceError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let mut image = decode(id, &record)?;
        image.id = Some(id);
        Ok(image)
    }

    /// Load a state image. Records are written once, so the status of
    /// the returned image comes from the state's markers.
    pub fn get(&self, id: StateId) -> Result<StateImage, WorkspaceError> {
        let mut image = self.load(id)?;
        if let Some(status) = self.marker_status(id)? {
            image.status = status
        }
        Ok(image)
    }

    fn marker_status(&self, id: StateId) -> Result<Option<Status>, WorkspaceError> {
        match fs::read(self.marker(CLOSED, id)) {
            Ok(bytes) => return Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        if self.marker(CLAIMED, id).exists() {
            Ok(Some(Status::Running))
        } else if self.marker(READY, id).exists() {
            Ok(Some(Status::Ready))
        } else {
            Ok(None)
        }
    }

    /// The lifecycle status of a state: ready, running while claimed,
    /// or the status it was closed with.
    pub fn status(&self, id: StateId) -> Result<Status, WorkspaceError> {
        match self.marker_status(id)? {
            Some(status) => Ok(status),
            None => Ok(self.load(id)?.status),
        }
    }

    fn summary(&self, id: StateId) -> Result<Option<StateSummary>, WorkspaceError> {
        if let Ok(summaries) = self.summaries.read() {
            if let Some(summary) = summaries.get(&id) {
                return Ok(Some(summary.clone()));
            }
        }
        let bytes = match fs::read(self.marker(READY, id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let summary = match bincode::deserialize::<StateSummary>(&bytes) {
            Ok(summary) => summary,
            Err(_) => match self.load(id) {
                Ok(image) => image.summary(),
                Err(WorkspaceError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        if let Ok(mut summaries) = self.summaries.write() {
            summaries.insert(id, summary.clone());
        }
        Ok(Some(summary))
    }

    /// A snapshot of the ready set, in ascending id order. Entries can
    /// be claimed by another worker at any time after this returns.
    pub fn list_ready(&self) -> Result<Vec<ReadyState>, WorkspaceError> {
        let mut ready = Vec::new();
        for entry in fs::read_dir(self.root.join(READY))? {
            let id = match entry?.file_name().to_str().and_then(StateId::parse) {
                Some(id) => id,
                None => continue,
            };
            // A missing summary means the state was claimed since the
            // directory was listed.
            if let Some(summary) = self.summary(id)? {
                ready.push(ReadyState { id, summary })
            }
        }
        ready.sort_by_key(|state| state.id);
        Ok(ready)
    }

    /// Atomically move a state from ready to claimed. Returns false if
    /// the state is no longer ready, which means another worker got
    /// there first.
    pub fn claim(&self, id: StateId) -> Result<bool, WorkspaceError> {
        let claimed = self.marker(CLAIMED, id);
        match fs::rename(self.marker(READY, id), &claimed) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if let Ok(mut summaries) = self.summaries.write() {
            summaries.remove(&id);
        }
        // The liveness sweep ages claims by modification time, which
        // a rename does not update.
        let touched = OpenOptions::new().write(true).open(&claimed).and_then(|fd| fd.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            log!(log::WORKSPACE, &format!("Could not timestamp claim of state {}: {}", id, e))
        }
        Ok(true)
    }

    /// Return a claimed state to the ready set without changing its
    /// record. Used when a run is interrupted before finishing.
    pub fn unclaim(&self, id: StateId) -> Result<(), WorkspaceError> {
        match fs::rename(self.marker(CLAIMED, id), self.marker(READY, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(WorkspaceError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a state from the ready set for good, keeping its record.
    /// The closed marker holds `status`, and is in place before the
    /// ready or claimed marker goes away. Closing an already closed
    /// state does nothing.
    pub fn mark_closed(&self, id: StateId, status: &Status) -> Result<(), WorkspaceError> {
        if self.marker(CLOSED, id).exists() {
            return Ok(());
        }
        let known = self.record_path(id).exists() || self.marker(CLAIMED, id).exists() || self.marker(READY, id).exists();
        if !known {
            return Err(WorkspaceError::NotFound(id));
        }
        self.publish(CLOSED, &id.to_string(), &bincode::serialize(status)?, false)?;
        for dir in &[CLAIMED, READY] {
            match fs::remove_file(self.marker(dir, id)) {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
        }
        if let Ok(mut summaries) = self.summaries.write() {
            summaries.remove(&id);
        }
        Ok(())
    }

    /// Move claims older than `grace` back into the ready set. A claim
    /// this old is assumed to belong to a worker that died.
    pub fn requeue_stale(&self, grace: Duration) -> Result<Vec<StateId>, WorkspaceError> {
        let now = SystemTime::now();
        let mut requeued = Vec::new();
        for entry in fs::read_dir(self.root.join(CLAIMED))? {
            let entry = entry?;
            let id = match entry.file_name().to_str().and_then(StateId::parse) {
                Some(id) => id,
                None => continue,
            };
            let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if now.duration_since(modified).unwrap_or_default() < grace {
                continue;
            }
            match fs::rename(entry.path(), self.marker(READY, id)) {
                Ok(()) => {
                    log!(log::WORKSPACE, &format!("Requeued stale claim on state {}", id));
                    requeued.push(id)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        requeued.sort();
        Ok(requeued)
    }

    pub fn record_visited_all(&self, addrs: &[Address]) -> Result<(), WorkspaceError> {
        if addrs.is_empty() {
            return Ok(());
        }
        let mut lines = String::with_capacity(addrs.len() * 19);
        for addr in addrs {
            lines.push_str(&format!("{:#018x}\n", addr))
        }
        append(&self.visited, &lines, false)
    }

    pub fn record_testcase(&self, report: &TerminalReport) -> Result<(), WorkspaceError> {
        let mut line = serde_json::to_string(report)?;
        line.push('\n');
        append(&self.testcases, &line, true)
    }

    pub fn record_assertion_hit(&self, addr: Address, id: StateId) -> Result<(), WorkspaceError> {
        append(&self.assertions, &format!("{:#018x} {}\n", addr, id), true)
    }

    pub fn read_visited(&self) -> Result<BTreeSet<Address>, WorkspaceError> {
        let contents = read_log(&self.root.join(VISITED))?;
        complete_lines(&contents)
            .map(|line| {
                parse_address(line.trim())
                    .ok_or_else(|| WorkspaceError::Corrupt(format!("bad visited address {:?}", line)))
            })
            .collect()
    }

    pub fn read_testcases(&self) -> Result<Vec<TerminalReport>, WorkspaceError> {
        let contents = read_log(&self.root.join(TESTCASES))?;
        complete_lines(&contents).map(|line| Ok(serde_json::from_str(line)?)).collect()
    }

    pub fn read_assertion_hits(&self) -> Result<BTreeSet<(Address, StateId)>, WorkspaceError> {
        let contents = read_log(&self.root.join(ASSERTIONS))?;
        complete_lines(&contents)
            .map(|line| {
                let mut words = line.split_whitespace();
                let addr = words.next().and_then(parse_address);
                let id = words.next().and_then(StateId::parse);
                match (addr, id) {
                    (Some(addr), Some(id)) => Ok((addr, id)),
                    _ => Err(WorkspaceError::Corrupt(format!("bad assertion record {:?}", line))),
                }
            })
            .collect()
    }

    /// SHA-256 of the sorted, de-duplicated visited addresses, one
    /// `0x%016x` address per line. Independent of worker interleaving.
    pub fn visited_digest(&self) -> Result<String, WorkspaceError> {
        let mut hasher = Sha256::new();
        for addr in self.read_visited()? {
            hasher.input(format!("{:#018x}\n", addr).as_bytes())
        }
        Ok(hasher.result().iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn counts(&self) -> Result<Counts, WorkspaceError> {
        Ok(Counts {
            states: count_entries(&self.root.join(STATES))?,
            ready: count_entries(&self.root.join(READY))?,
            claimed: count_entries(&self.root.join(CLAIMED))?,
            closed: count_entries(&self.root.join(CLOSED))?,
        })
    }
}

/// A fresh, empty directory path for a test workspace.
#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    static SCRATCH: AtomicU64 = AtomicU64::new(0);
    let n = SCRATCH.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("spelunk_{}_test_{}_{}", tag, process::id(), n));
    let _ = fs::remove_dir_all(&dir);
    dir
}

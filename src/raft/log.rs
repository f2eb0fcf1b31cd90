use serde_derive::{Deserialize, Serialize};

use super::membership::ClusterConfig;
use super::node::{NodeID, Term};
use crate::encoding::{bincode, Value as _};
use crate::error::Result;
use crate::storage;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry command.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// A noop, appended when a leader assumes office to commit entries from
    /// prior terms (Raft paper §5.4.2).
    Noop,
    /// An opaque state machine write command.
    Write(Vec<u8>),
    /// A cluster configuration change. Nodes adopt the configuration as soon
    /// as the entry is appended, without waiting for it to commit.
    Config(ClusterConfig),
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The command.
    pub command: Command,
}

impl crate::encoding::Value for Entry {}

/// A state machine snapshot. Replaces the log prefix up to and including its
/// index; the snapshot index is never beyond the commit index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last log entry covered by the snapshot.
    pub index: Index,
    /// The term of that entry.
    pub term: Term,
    /// The cluster configuration as of the snapshot.
    pub config: ClusterConfig,
    /// The serialized state machine image.
    pub data: Vec<u8>,
}

impl crate::encoding::Value for Snapshot {}

/// A log storage key. Entry keys must sort by index, so the index is encoded
/// as big-endian bytes under a common prefix; metadata keys use separate
/// single-byte prefixes.
enum Key {
    /// A log entry, keyed by index.
    Entry(Index),
    /// The current term and vote (if any).
    TermVote,
    /// The current commit index and term.
    CommitIndex,
    /// The latest snapshot.
    Snapshot,
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = Vec::with_capacity(9);
                key.push(0x00);
                key.extend(index.to_be_bytes());
                key
            }
            Key::TermVote => vec![0x01],
            Key::CommitIndex => vec![0x02],
            Key::Snapshot => vec![0x03],
        }
    }
}

/// The Raft log stores a sequence of arbitrary commands replicated across
/// nodes and applied sequentially to the local state machine. Each entry
/// contains an index, a command, and the term in which the leader proposed
/// it.
///
/// A key/value storage engine stores the entries on disk, keyed by index,
/// along with metadata keys (current term and vote, commit index, and the
/// latest snapshot).
///
/// In the steady state the log is append-only: the leader appends a command
/// via [`Log::append`] and replicates it to followers who append it via
/// [`Log::splice`]. Once an index is replicated to a quorum it is committed
/// via [`Log::commit`], making the log immutable up to that index.
/// Uncommitted entries may still be replaced if a new leader overrides them.
///
/// Once a snapshot is taken, the log prefix it covers is removed via
/// [`Log::compact`]; `prefix_index`/`prefix_term` then track the last
/// compacted entry, which [`Log::has`] treats as present.
///
/// Invariants:
///
/// * Entry indexes are contiguous (no index gaps) from the compacted prefix.
/// * Entry terms never decrease from the previous entry.
/// * Appended entries are durable (flushed to disk) before acknowledgment.
/// * Committed entries are never changed or removed.
/// * The snapshot index never exceeds the commit index.
pub struct Log {
    /// The underlying storage engine. A trait object allows runtime engine
    /// selection without propagating generics throughout Raft.
    engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index of the last compacted entry (0 if never compacted).
    prefix_index: Index,
    /// The term of the last compacted entry.
    prefix_term: Term,
}

impl Log {
    /// Initializes a log using the given storage engine, recovering state
    /// from any previous run.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let (prefix_index, prefix_term) = engine
            .get(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()?
            .map(|s| (s.index, s.term))
            .unwrap_or((0, 0));
        let (last_index, last_term) = engine
            .scan_dyn((
                std::ops::Bound::Included(Key::Entry(0).encode()),
                std::ops::Bound::Included(Key::Entry(Index::MAX).encode()),
            ))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or((prefix_index, prefix_term));
        Ok(Self {
            engine,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            prefix_index,
            prefix_term,
        })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the compacted prefix index and term.
    pub fn get_prefix_index(&self) -> (Index, Term) {
        (self.prefix_index, self.prefix_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any), flushed to disk before
    /// returning. Enforces that the term does not regress, and that we only
    /// vote for one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log at the current term and flushes it to
    /// disk, returning its index.
    pub fn append(&mut self, command: Command) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let term = match self.get(index)? {
            Some(e) if e.index < self.commit_index => {
                panic!("commit index regression {} → {}", self.commit_index, e.index);
            }
            Some(e) if e.index == self.commit_index => return Ok(index),
            Some(e) => e.term,
            None => panic!("commit index {index} does not exist"),
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        // NB: the commit index doesn't need to be fsynced, since the entries
        // are fsynced and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// compacted entries).
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Compacted entries are considered present: they were committed, so by
    /// log matching any index/term pair at or below the prefix matches.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if index == self.prefix_index {
            return Ok(term == self.prefix_term);
        }
        if index < self.prefix_index {
            return Ok(true);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan_dyn((from, to)))
    }

    /// Returns an iterator over entries that are ready to apply, starting
    /// after the given applied index up to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        // NB: commit_index can regress below applied_index on restart, since
        // the commit index is not flushed. It is recovered from a quorum.
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and
    /// must connect to the existing log (or compacted prefix). Entries
    /// already in the log with matching terms are ignored. Overlapping
    /// entries with different terms truncate the existing log at the first
    /// conflict and replace it.
    pub fn splice(&mut self, mut entries: Vec<Entry>) -> Result<Index> {
        // Entries at or below the compacted prefix are committed and
        // identical by log matching, so skip them.
        entries.retain(|e| e.index > self.prefix_index);

        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }

        // Check that the entries connect to the existing log (if any), and
        // that the term doesn't regress.
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        if first.index != self.prefix_index + 1 {
            match self.get(first.index - 1)? {
                Some(base) if first.term < base.term => {
                    panic!("splice term regression {} → {}", base.term, first.term)
                }
                Some(_) => {}
                None if first.index == 1 => {}
                None => panic!("first index {} must touch existing log", first.index),
            }
        }

        // Skip entries that are already in the log.
        let mut entries = entries.as_slice();
        let mut scan = self.scan(entries[0].index..=entries[entries.len() - 1].index);
        while let Some(entry) = scan.next().transpose()? {
            assert!(entry.index == entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };
        let last = entries.last().expect("entries can't be empty");

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. We can't write below the commit index,
        // since those entries are immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Stores a snapshot and compacts the log prefix it covers. The snapshot
    /// index must not exceed the commit index, since compacted entries can
    /// never be recovered.
    pub fn compact(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(
            snapshot.index <= self.commit_index,
            "snapshot index {} beyond commit index {}",
            snapshot.index,
            self.commit_index
        );
        assert!(
            snapshot.index > self.prefix_index,
            "snapshot index regression {} → {}",
            self.prefix_index,
            snapshot.index
        );
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        for index in self.prefix_index + 1..=snapshot.index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;
        self.prefix_index = snapshot.index;
        self.prefix_term = snapshot.term;
        Ok(())
    }

    /// Installs a snapshot received from a leader, replacing the log. If the
    /// log contains an entry matching the snapshot's index and term, the
    /// entries following it are retained (they connect to the snapshot);
    /// otherwise the entire log is discarded. The snapshot must be more
    /// recent than the local commit index, otherwise it is rejected.
    pub fn install(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(
            snapshot.index > self.commit_index,
            "snapshot index {} at or below commit index {}",
            snapshot.index,
            self.commit_index
        );
        let retain = self.has(snapshot.index, snapshot.term)?;
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine
            .set(&Key::CommitIndex.encode(), bincode::serialize(&(snapshot.index, snapshot.term)))?;
        let until = if retain { snapshot.index } else { self.last_index };
        for index in self.prefix_index + 1..=until {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;
        if !retain {
            self.last_index = snapshot.index;
            self.last_term = snapshot.term;
        }
        self.prefix_index = snapshot.index;
        self.prefix_term = snapshot.term;
        self.commit_index = snapshot.index;
        self.commit_term = snapshot.term;
        Ok(())
    }

    /// Fetches the latest stored snapshot, if any.
    pub fn get_snapshot(&mut self) -> Result<Option<Snapshot>> {
        self.engine.get(&Key::Snapshot.encode())?.map(|v| Snapshot::decode(&v)).transpose()
    }

    /// Returns log storage engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

impl DoubleEndedIterator for Iterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> Log {
        Log::new(Box::new(crate::storage::Memory::new())).expect("log init failed")
    }

    fn write(command: &[u8]) -> Command {
        Command::Write(command.to_vec())
    }

    #[test]
    fn append_and_get() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        assert_eq!(log.append(write(b"a"))?, 1);
        assert_eq!(log.append(Command::Noop)?, 2);
        assert_eq!(log.get(1)?, Some(Entry { index: 1, term: 1, command: write(b"a") }));
        assert_eq!(log.get(2)?, Some(Entry { index: 2, term: 1, command: Command::Noop }));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.get_last_index(), (2, 1));
        Ok(())
    }

    #[test]
    fn set_term_persists_vote() -> Result<()> {
        let mut log = setup();
        log.set_term(3, Some(7))?;
        assert_eq!(log.get_term(), (3, Some(7)));
        // Same term with same vote is a noop.
        log.set_term(3, Some(7))?;
        // A later term clears the vote.
        log.set_term(4, None)?;
        assert_eq!(log.get_term(), (4, None));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn set_term_regression_panics() {
        let mut log = setup();
        log.set_term(2, None).unwrap();
        log.set_term(1, None).unwrap();
    }

    #[test]
    fn commit_advances_monotonically() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(write(b"a"))?;
        log.append(write(b"b"))?;
        log.commit(1)?;
        assert_eq!(log.get_commit_index(), (1, 1));
        log.commit(2)?;
        assert_eq!(log.get_commit_index(), (2, 1));
        Ok(())
    }

    #[test]
    fn has_checks_index_and_term() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(write(b"a"))?;
        log.set_term(2, None)?;
        log.append(write(b"b"))?;
        assert!(log.has(1, 1)?);
        assert!(log.has(2, 2)?);
        assert!(!log.has(1, 2)?);
        assert!(!log.has(2, 1)?);
        assert!(!log.has(0, 0)?);
        assert!(!log.has(3, 2)?);
        Ok(())
    }

    #[test]
    fn splice_appends_and_truncates_conflicts() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(write(b"a"))?;
        log.append(write(b"b"))?;
        log.append(write(b"c"))?;
        log.set_term(2, None)?;

        // Splicing a conflicting suffix truncates it.
        log.splice(vec![
            Entry { index: 2, term: 2, command: write(b"x") },
            Entry { index: 3, term: 2, command: write(b"y") },
            Entry { index: 4, term: 2, command: write(b"z") },
        ])?;
        assert_eq!(log.get_last_index(), (4, 2));
        assert_eq!(log.get(2)?.unwrap().command, write(b"x"));

        // Splicing existing entries is a noop and retains the tail.
        log.splice(vec![Entry { index: 2, term: 2, command: write(b"x") }])?;
        assert_eq!(log.get_last_index(), (4, 2));
        assert_eq!(log.get(4)?.unwrap().command, write(b"z"));
        Ok(())
    }

    #[test]
    fn splice_truncates_tail_on_conflict() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(write(b"a"))?;
        log.append(write(b"b"))?;
        log.append(write(b"c"))?;
        log.set_term(2, None)?;
        // A conflicting entry at index 2 removes the old entries at 2 and 3.
        log.splice(vec![Entry { index: 2, term: 2, command: write(b"x") }])?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get(3)?, None);
        Ok(())
    }

    #[test]
    fn compact_removes_prefix() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        for c in [b"a", b"b", b"c", b"d"] {
            log.append(write(c))?;
        }
        log.commit(3)?;
        let config = ClusterConfig::new([1, 2, 3]);
        log.compact(Snapshot { index: 3, term: 1, config, data: vec![0xff] })?;
        assert_eq!(log.get_prefix_index(), (3, 1));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.get(4)?.map(|e| e.index), Some(4));
        // Compacted entries count as present for consistency checks.
        assert!(log.has(3, 1)?);
        assert!(log.has(2, 9)?); // below prefix, assumed committed
        assert!(!log.has(3, 2)?);
        Ok(())
    }

    #[test]
    fn install_discards_divergent_log() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(write(b"a"))?;
        log.append(write(b"b"))?;
        let config = ClusterConfig::new([1, 2, 3]);
        let snapshot = Snapshot { index: 5, term: 3, config, data: vec![0xab] };
        log.set_term(3, None)?;
        log.install(snapshot.clone())?;
        assert_eq!(log.get_prefix_index(), (5, 3));
        assert_eq!(log.get_last_index(), (5, 3));
        assert_eq!(log.get_commit_index(), (5, 3));
        assert_eq!(log.get_snapshot()?, Some(snapshot));
        Ok(())
    }

    #[test]
    fn recovers_from_storage() -> Result<()> {
        let mut engine: Box<dyn crate::storage::Engine> = Box::new(crate::storage::Memory::new());
        {
            let mut log = Log::new(engine)?;
            log.set_term(2, Some(1))?;
            log.append(write(b"a"))?;
            log.append(write(b"b"))?;
            log.commit(1)?;
            engine = log.engine;
        }
        let mut log = Log::new(engine)?;
        assert_eq!(log.get_term(), (2, Some(1)));
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get_commit_index(), (1, 2));
        assert_eq!(log.get(2)?.map(|e| e.index), Some(2));
        Ok(())
    }
}

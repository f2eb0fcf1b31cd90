use serde_derive::{Deserialize, Serialize};

use super::log::{Command, Entry, Index};
use crate::encoding::{bincode, Value as _};
use crate::error::Result;

/// A replicated state machine. Raft itself doesn't care what the state
/// machine is; it simply passes opaque write commands to it in log order.
/// The state machine must be deterministic: the same commands applied in the
/// same order must produce identical state on every node, or the replicas
/// will diverge.
pub trait State: Send {
    /// Returns the index of the last applied entry.
    fn get_applied_index(&self) -> Index;

    /// Applies a committed log entry and returns the command result. Called
    /// for every committed entry in order, including noops and configuration
    /// changes, which only advance the applied index.
    ///
    /// Any returned error must be deterministic (see
    /// [`crate::error::Error::is_deterministic`]): deterministic errors are command results
    /// and are passed to the client, while non-deterministic errors (e.g. IO
    /// errors) halt the node to avoid replica divergence.
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>>;

    /// Returns a serialized snapshot of the entire state machine, for log
    /// compaction and lagging-peer catchup.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the state machine with the given snapshot, taken at the
    /// given applied index.
    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()>;
}

/// A command for the key/value reference state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KVCommand {
    /// Sets a key to a value, returning the encoded previous value.
    Put { key: String, value: String },
    /// Deletes a key, returning the encoded previous value.
    Delete { key: String },
}

impl crate::encoding::Value for KVCommand {}

/// A simple in-memory key/value state machine, used by tests and examples.
pub struct KVState {
    applied_index: Index,
    data: std::collections::BTreeMap<String, String>,
}

impl KVState {
    pub fn new() -> Self {
        Self { applied_index: 0, data: std::collections::BTreeMap::new() }
    }

    /// Reads a key directly from the local state machine.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }
}

impl State for KVState {
    fn get_applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        assert_eq!(entry.index, self.applied_index + 1, "entries must be applied in order");
        self.applied_index = entry.index;
        let command = match &entry.command {
            Command::Write(command) => KVCommand::decode(command)?,
            // Noops and configuration changes only advance the applied index.
            Command::Noop | Command::Config(_) => return Ok(Vec::new()),
        };
        let previous = match command {
            KVCommand::Put { key, value } => self.data.insert(key, value),
            KVCommand::Delete { key } => self.data.remove(&key),
        };
        Ok(bincode::serialize(&previous))
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.data))
    }

    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data)?;
        self.applied_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use pretty_assertions::assert_eq;

    fn entry(index: Index, command: Command) -> Entry {
        Entry { index, term: 1, command }
    }

    #[test]
    fn applies_in_order() -> Result<()> {
        let mut state = KVState::new();
        let put = KVCommand::Put { key: "x".into(), value: "1".into() };
        state.apply(&entry(1, Command::Write(put.encode())))?;
        assert_eq!(state.get("x"), Some(&"1".to_string()));
        assert_eq!(state.get_applied_index(), 1);

        // Noops advance the applied index without changing state.
        state.apply(&entry(2, Command::Noop))?;
        assert_eq!(state.get_applied_index(), 2);

        let delete = KVCommand::Delete { key: "x".into() };
        let result = state.apply(&entry(3, Command::Write(delete.encode())))?;
        assert_eq!(state.get("x"), None);
        let previous: Option<String> = bincode::deserialize(&result)?;
        assert_eq!(previous, Some("1".to_string()));
        Ok(())
    }

    #[test]
    fn snapshot_roundtrip() -> Result<()> {
        let mut state = KVState::new();
        let put = KVCommand::Put { key: "a".into(), value: "b".into() };
        state.apply(&entry(1, Command::Write(put.encode())))?;
        let snapshot = state.snapshot()?;

        let mut restored = KVState::new();
        restored.restore(7, &snapshot)?;
        assert_eq!(restored.get("a"), Some(&"b".to_string()));
        assert_eq!(restored.get_applied_index(), 7);
        Ok(())
    }
}

use super::{Engine, Status};
use crate::error::Result;

/// An in-memory key/value storage engine using the Rust standard library
/// B-tree implementation. Data is not persisted. Primarily used for tests.
pub struct Memory {
    data: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory key-value storage engine.
    pub fn new() -> Self {
        Self { data: std::collections::BTreeMap::new() }
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { inner: self.data.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
        })
    }
}

pub struct ScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl ScanIterator<'_> {
    fn map(item: (&Vec<u8>, &Vec<u8>)) -> <Self as Iterator>::Item {
        let (key, value) = item;
        Ok((key.clone(), value.clone()))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Self::map)
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(Self::map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> Result<()> {
        let mut m = Memory::new();
        assert_eq!(m.get(b"a")?, None);
        m.set(b"a", vec![1])?;
        assert_eq!(m.get(b"a")?, Some(vec![1]));
        m.set(b"a", vec![2])?;
        assert_eq!(m.get(b"a")?, Some(vec![2]));
        m.delete(b"a")?;
        assert_eq!(m.get(b"a")?, None);
        m.delete(b"b")?; // delete of missing key is a noop
        Ok(())
    }

    #[test]
    fn scan_ordered() -> Result<()> {
        let mut m = Memory::new();
        m.set(b"b", vec![2])?;
        m.set(b"a", vec![1])?;
        m.set(b"c", vec![3])?;
        let kvs: Vec<_> = m.scan(..).collect::<Result<_>>()?;
        assert_eq!(
            kvs,
            vec![
                (b"a".to_vec(), vec![1]),
                (b"b".to_vec(), vec![2]),
                (b"c".to_vec(), vec![3]),
            ]
        );
        let kvs: Vec<_> = m.scan(b"a".to_vec()..b"c".to_vec()).rev().collect::<Result<_>>()?;
        assert_eq!(kvs, vec![(b"b".to_vec(), vec![2]), (b"a".to_vec(), vec![1])]);
        Ok(())
    }
}

use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog models the log without durability. Used by tests and for ephemeral nodes.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: vec![],
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some(self.first_index.distance_to(index) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.log.get(i)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        self.log.truncate(vec_index);
        Ok(())
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        let new_first_index = through.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        let num_to_drop = self.first_index.distance_to(new_first_index) as usize;
        if num_to_drop >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(..num_to_drop);
        }
        self.first_index = new_first_index;

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::TestEntry;

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        assert_eq!(log.next_index(), Index::new(1));

        for i in 1..=5u8 {
            assert_eq!(log.append(TestEntry(vec![i])).unwrap(), Index::new(i as u64));
        }
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(TestEntry(vec![3])));
        assert_eq!(log.read(Index::new(6)).unwrap(), None);

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);

        assert_eq!(log.append(TestEntry(vec![40])).unwrap(), Index::new(4));
        assert_eq!(
            log.read_range(Index::new(2), 10).unwrap(),
            vec![TestEntry(vec![2]), TestEntry(vec![3]), TestEntry(vec![40])]
        );
    }

    #[test]
    fn compact_prefix_and_past_tail() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for i in 1..=5u8 {
            log.append(TestEntry(vec![i])).unwrap();
        }

        log.compact(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(TestEntry(vec![4])));

        // Compacting backwards is a no-op.
        log.compact(Index::new(2)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));

        log.compact(Index::new(9)).unwrap();
        assert_eq!(log.first_index(), Index::new(10));
        assert_eq!(log.next_index(), Index::new(10));
        assert_eq!(log.append(TestEntry(vec![10])).unwrap(), Index::new(10));

        // Truncating below the first index clears the log but keeps the boundary.
        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.next_index(), Index::new(10));
    }
}

use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        match self.as_u64().checked_sub(delta) {
            Some(new_value) if new_value > 0 => Some(Index::new(new_value)),
            _ => None,
        }
    }

    /// Number of indexes in `[self, end)`. Zero if `end <= self`.
    pub fn distance_to(&self, end: Index) -> u64 {
        end.as_u64().saturating_sub(self.as_u64())
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. After a prefix of the log is compacted away, `first_index()`
/// moves forward and reads below it return `None`.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry. Returns only after the
    /// entry is durable.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Read up to `max_entries` consecutive entries starting at `start`. Stops early at the tail.
    fn read_range(&self, start: Index, max_entries: usize) -> Result<Vec<E>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while entries.len() < max_entries {
            match self.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Hard-deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Hard-deletes anything at `through` and earlier. If `through` is at or past the tail, the log
    /// becomes empty and the next append lands at `through + 1`.
    fn compact(&mut self, through: Index) -> Result<(), io::Error>;

    /// first_index returns the lowest index that may still hold an entry.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let i = Index::new(5);
        assert_eq!(i.plus(2), Index::new(7));
        assert_eq!(i.checked_minus(4), Some(Index::new(1)));
        assert_eq!(i.checked_minus(5), None);
        assert_eq!(i.checked_minus(10), None);
        assert_eq!(i.distance_to(Index::new(8)), 3);
        assert_eq!(i.distance_to(Index::new(2)), 0);
    }
}

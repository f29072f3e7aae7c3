use crate::commitlog;
use crate::grpc::ProtoHardState;
use crate::replica::peers::ReplicaId;
use prost::Message;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the raft algorithm requires that something is persisted
/// to a durable store to guarantee safety. Not everything that uses disk has to go through this,
/// only algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. A returned
/// `Err` means the new state may not be durable and the replica must stop.
pub(crate) trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId)
        -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// In-memory term/vote state. Loses everything on restart, so it's only safe for tests.
#[derive(Clone)]
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            Ok(false)
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            Ok(true)
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

const HARD_STATE_FILE_NAME: &str = "raft-state";
const HARD_STATE_TMP_FILE_NAME: &str = "raft-state.tmp";

/// Term/vote state persisted as a single `ProtoHardState` file. Each mutation is applied to a copy
/// of the in-memory state, written via temp file + rename, and only then made visible.
pub(crate) struct DurableLocalState {
    directory: PathBuf,
    state: VolatileLocalState,
}

impl DurableLocalState {
    pub(crate) fn open(directory: PathBuf, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;
        let mut state = VolatileLocalState::new(my_replica_id);

        match fs::read(directory.join(HARD_STATE_FILE_NAME)) {
            Ok(bytes) => {
                let proto =
                    ProtoHardState::decode(&bytes[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                state.current_term = Term::new(proto.current_term);
                if !proto.voted_for.is_empty() {
                    state.voted_for_this_term = Some(Arc::new(ReplicaId::new(proto.voted_for)));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => { /* Brand new replica */ }
            Err(e) => return Err(e),
        }

        Ok(DurableLocalState { directory, state })
    }

    fn persist(&self, state: &VolatileLocalState) -> Result<(), io::Error> {
        let proto = ProtoHardState {
            current_term: state.current_term.as_u64(),
            voted_for: state
                .voted_for_this_term
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
        };
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let tmp_path = self.directory.join(HARD_STATE_TMP_FILE_NAME);
        let mut tmp = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.directory.join(HARD_STATE_FILE_NAME))?;
        commitlog::sync_dir(&self.directory)
    }

    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut VolatileLocalState) -> Result<T, io::Error>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, io::Error> {
        let mut next = self.state.clone();
        let output = op(&mut next)?;
        if changed(&output) {
            self.persist(&next)?;
            self.state = next;
        }

        Ok(output)
    }
}

impl PersistentLocalState for DurableLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        self.mutate(|s| s.store_term_if_increased(new_term), |mutated| *mutated)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        self.mutate(|s| s.store_vote_for_term_if_unvoted(expected_term, vote), |mutated| *mutated)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.mutate(|s| s.increment_term_and_vote_for_self(), |_| true)
    }

    fn current_term(&self) -> Term {
        self.state.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.state.voted_for_current_term()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_cas_semantics() {
        let mut state = VolatileLocalState::new(ReplicaId::new("me"));

        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());

        // Only one vote per term, and only for the current term.
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(2), ReplicaId::new("a"))
            .unwrap());
        assert!(state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("a"))
            .unwrap());
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("b"))
            .unwrap());

        let new_term = state.increment_term_and_vote_for_self().unwrap();
        assert_eq!(new_term, Term::new(4));
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(4));
        assert_eq!(voted_for.as_deref(), Some(&ReplicaId::new("me")));
    }

    #[test]
    fn durable_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = DurableLocalState::open(dir.path().to_path_buf(), ReplicaId::new("me")).unwrap();
            assert_eq!(state.current_term(), Term::new(0));
            state.store_term_if_increased(Term::new(7)).unwrap();
            state
                .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("other"))
                .unwrap();
        }

        let mut state = DurableLocalState::open(dir.path().to_path_buf(), ReplicaId::new("me")).unwrap();
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(7));
        assert_eq!(voted_for.as_deref(), Some(&ReplicaId::new("other")));

        // Vote is still spent after the restart.
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("third"))
            .unwrap());

        state.increment_term_and_vote_for_self().unwrap();
        drop(state);
        let state = DurableLocalState::open(dir.path().to_path_buf(), ReplicaId::new("me")).unwrap();
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(8));
        assert_eq!(voted_for.as_deref(), Some(&ReplicaId::new("me")));
    }
}

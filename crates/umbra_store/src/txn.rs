//! Per-transaction store state.

use crate::types::{ClassId, ObjectId, TxnId};
use crate::wal::LogRecord;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Lifecycle phase of a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnPhase {
    /// Accepting operations.
    Active,
    /// Mutations are logged; awaiting the commit/abort decision.
    Prepared {
        /// The transaction staged no writes; commit is a no-op.
        read_only: bool,
    },
}

/// Registry entry for an in-flight transaction.
///
/// The deadline is immutable so the sweep can read it without taking the
/// body lock.
#[derive(Debug)]
pub(crate) struct TxnEntry {
    pub id: TxnId,
    pub deadline: Instant,
    pub body: Mutex<TxnBody>,
}

impl TxnEntry {
    pub fn new(id: TxnId, deadline: Instant) -> Self {
        Self {
            id,
            deadline,
            body: Mutex::new(TxnBody::new()),
        }
    }
}

/// Staged effects of a transaction, applied at commit.
///
/// `None` values are tombstones: a staged object removal or binding
/// removal. Reads within the transaction consult these maps first, giving
/// read-your-writes.
#[derive(Debug)]
pub(crate) struct TxnBody {
    pub phase: TxnPhase,
    /// Staged object payloads; `None` marks removal.
    pub objects: HashMap<ObjectId, Option<Vec<u8>>>,
    /// Staged binding changes; `None` marks removal. Ordered so staged
    /// names merge into binding enumeration.
    pub bindings: BTreeMap<String, Option<ObjectId>>,
    /// Class descriptors first encountered by this transaction, in
    /// assignment order.
    pub classes: Vec<(ClassId, Vec<u8>)>,
}

impl TxnBody {
    fn new() -> Self {
        Self {
            phase: TxnPhase::Active,
            objects: HashMap::new(),
            bindings: BTreeMap::new(),
            classes: Vec::new(),
        }
    }

    /// Whether the transaction staged any mutation.
    pub fn has_writes(&self) -> bool {
        !self.objects.is_empty() || !self.bindings.is_empty() || !self.classes.is_empty()
    }

    /// Builds the log records for the staged mutations, without the
    /// trailing `Prepare` marker.
    pub fn build_records(&self, txn: TxnId) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for (class, descriptor) in &self.classes {
            records.push(LogRecord::ClassDef {
                txn,
                class: *class,
                descriptor: descriptor.clone(),
            });
        }
        for (id, staged) in &self.objects {
            match staged {
                Some(bytes) => records.push(LogRecord::Put {
                    txn,
                    id: *id,
                    bytes: bytes.clone(),
                }),
                None => records.push(LogRecord::Remove { txn, id: *id }),
            }
        }
        for (name, staged) in &self.bindings {
            match staged {
                Some(id) => records.push(LogRecord::SetBinding {
                    txn,
                    name: name.clone(),
                    id: *id,
                }),
                None => records.push(LogRecord::RemoveBinding {
                    txn,
                    name: name.clone(),
                }),
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_body_has_no_writes() {
        let body = TxnBody::new();
        assert!(!body.has_writes());
        assert_eq!(body.phase, TxnPhase::Active);
    }

    #[test]
    fn staged_mutations_become_records() {
        let txn = TxnId::new(3);
        let mut body = TxnBody::new();
        body.objects
            .insert(ObjectId::new(1).unwrap(), Some(vec![1, 2]));
        body.objects.insert(ObjectId::new(2).unwrap(), None);
        body.bindings
            .insert("a.x".to_string(), Some(ObjectId::new(1).unwrap()));
        body.bindings.insert("a.y".to_string(), None);
        body.classes.push((ClassId::new(1), b"demo".to_vec()));

        assert!(body.has_writes());
        let records = body.build_records(txn);
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.txn() == txn));
    }
}

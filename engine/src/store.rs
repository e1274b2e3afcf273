//! Local store collaborator.
//!
//! The engine consumes the local store through [`LocalStore`] and
//! [`Transaction`]. User records, sync metadata, the outbox and checkpoints
//! share one transactional boundary so every read-modify-write against a
//! record's metadata is atomic with respect to the record itself.
//!
//! [`MemoryStore`] is the bundled implementation: an in-memory snapshot with
//! optional file backing that survives process death.

use crate::mutation::Sequence;
use crate::snapshot::StoreSnapshot;
use crate::{
    error::Result, Error, ModelName, ModelRegistry, MutationEvent, Record, RecordId,
    SchemaVersion, SyncMetadata, Timestamp,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Read-your-writes view of the store inside a transaction.
///
/// Writes become visible to other readers only when the enclosing
/// [`LocalStore::transaction`] body returns `Ok`.
pub trait Transaction {
    fn record(&self, model: &str, id: &str) -> Option<Record>;

    fn metadata(&self, model: &str, id: &str) -> Option<SyncMetadata>;

    /// Every outbox entry in sequence order.
    fn mutations(&self) -> Vec<MutationEvent>;

    /// Outbox entries for one record in sequence order.
    fn mutations_for(&self, model: &str, id: &str) -> Vec<MutationEvent>;

    fn checkpoint(&self, model: &str) -> Option<Timestamp>;

    /// Insert or replace a user record.
    fn save(&mut self, record: Record);

    /// Remove a user record, returning it if it existed.
    fn delete(&mut self, model: &str, id: &str) -> Option<Record>;

    fn save_metadata(&mut self, metadata: SyncMetadata);

    /// Append to the outbox. The event receives the next sequence, which is returned.
    fn append_mutation(&mut self, event: MutationEvent) -> Sequence;

    /// Replace an existing outbox entry, matched by sequence.
    fn update_mutation(&mut self, event: MutationEvent) -> Result<()>;

    fn remove_mutation(&mut self, sequence: Sequence) -> Option<MutationEvent>;

    fn set_checkpoint(&mut self, model: &str, at: Timestamp);
}

/// Durable, transactional local storage.
pub trait LocalStore: Send + Sync {
    fn query_by_id(&self, model: &str, id: &str) -> Result<Option<Record>>;

    /// All records of a model, ordered by id.
    fn query(&self, model: &str) -> Result<Vec<Record>>;

    fn sync_metadata(&self, model: &str, id: &str) -> Result<Option<SyncMetadata>>;

    /// The outbox in sequence order.
    fn pending_mutations(&self) -> Result<Vec<MutationEvent>>;

    fn pending_mutations_for(&self, model: &str, id: &str) -> Result<Vec<MutationEvent>>;

    fn checkpoint(&self, model: &str) -> Result<Option<Timestamp>>;

    /// Run `body` atomically. Nothing it wrote is kept if it returns `Err`
    /// or if the commit fails.
    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>)
        -> Result<()>;

    /// Empty user records, sync metadata, outbox and checkpoints.
    fn clear(&self) -> Result<()>;

    /// Clear stale `in_process` flags left by an interrupted drain.
    fn reset_in_process(&self) -> Result<usize> {
        let mut reset = 0;
        self.transaction(&mut |tx| {
            reset = 0;
            for mut event in tx.mutations() {
                if event.in_process {
                    event.in_process = false;
                    tx.update_mutation(event)?;
                    reset += 1;
                }
            }
            Ok(())
        })?;
        Ok(reset)
    }
}

impl dyn LocalStore + '_ {
    /// Run a transaction that produces a value.
    pub fn transact<T>(
        &self,
        body: impl FnOnce(&mut dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut body = Some(body);
        let mut output = None;
        self.transaction(&mut |tx| {
            let body = body
                .take()
                .ok_or_else(|| Error::Storage("transaction body invoked twice".into()))?;
            output = Some(body(tx)?);
            Ok(())
        })?;
        output.ok_or_else(|| Error::Storage("transaction produced no result".into()))
    }
}

/// In-memory store with optional JSON file backing.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a volatile store.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            state: Mutex::new(StoreSnapshot::new(schema_version)),
            path: None,
        }
    }

    /// Open a file-backed store, loading and validating any existing snapshot.
    pub fn open(path: impl AsRef<Path>, registry: &ModelRegistry) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let snapshot = if path.exists() {
            let json = std::fs::read_to_string(&path).map_err(Error::storage)?;
            let snapshot = StoreSnapshot::from_json(&json)?;
            snapshot.validate(registry)?;
            tracing::debug!(
                path = %path.display(),
                records = snapshot.record_count(),
                pending = snapshot.outbox.len(),
                "loaded store snapshot"
            );
            snapshot
        } else {
            StoreSnapshot::new(registry.version)
        };

        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path),
        })
    }

    /// Copy of the current committed state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = snapshot.to_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = std::fs::File::create(&tmp).map_err(Error::storage)?;
        file.write_all(json.as_bytes()).map_err(Error::storage)?;
        file.sync_all().map_err(Error::storage)?;
        std::fs::rename(&tmp, path).map_err(Error::storage)?;
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn query_by_id(&self, model: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.state.lock().get_record(model, id).cloned())
    }

    fn query(&self, model: &str) -> Result<Vec<Record>> {
        let state = self.state.lock();
        Ok(state
            .records
            .get(model)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn sync_metadata(&self, model: &str, id: &str) -> Result<Option<SyncMetadata>> {
        Ok(self.state.lock().get_metadata(model, id).cloned())
    }

    fn pending_mutations(&self) -> Result<Vec<MutationEvent>> {
        Ok(self.state.lock().outbox.values().cloned().collect())
    }

    fn pending_mutations_for(&self, model: &str, id: &str) -> Result<Vec<MutationEvent>> {
        Ok(self
            .state
            .lock()
            .mutations_for(model, id)
            .cloned()
            .collect())
    }

    fn checkpoint(&self, model: &str) -> Result<Option<Timestamp>> {
        Ok(self.state.lock().checkpoints.get(model).copied())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let mut tx = MemoryTransaction {
            state: &mut *state,
            journal: Vec::new(),
        };

        if let Err(err) = body(&mut tx) {
            tx.rollback();
            return Err(err);
        }

        if tx.journal.is_empty() {
            return Ok(());
        }

        if let Err(err) = self.persist(tx.state) {
            tracing::error!(error = %err, "failed to persist store, rolling back");
            tx.rollback();
            return Err(err);
        }

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        let previous = state.clone();
        state.clear();

        if let Err(err) = self.persist(&state) {
            *state = previous;
            return Err(err);
        }
        Ok(())
    }
}

/// Undo entries recorded by a transaction, replayed in reverse on rollback.
enum Undo {
    Record {
        model: ModelName,
        id: RecordId,
        previous: Option<Record>,
    },
    Metadata {
        model: ModelName,
        id: RecordId,
        previous: Option<SyncMetadata>,
    },
    Mutation {
        sequence: Sequence,
        previous: Option<MutationEvent>,
    },
    Checkpoint {
        model: ModelName,
        previous: Option<Timestamp>,
    },
    NextSequence(Sequence),
}

struct MemoryTransaction<'a> {
    state: &'a mut StoreSnapshot,
    journal: Vec<Undo>,
}

fn restore<T>(
    table: &mut BTreeMap<ModelName, BTreeMap<RecordId, T>>,
    model: ModelName,
    id: RecordId,
    previous: Option<T>,
) {
    match previous {
        Some(value) => {
            table.entry(model).or_default().insert(id, value);
        }
        None => {
            if let Some(records) = table.get_mut(&model) {
                records.remove(&id);
                if records.is_empty() {
                    table.remove(&model);
                }
            }
        }
    }
}

impl MemoryTransaction<'_> {
    fn rollback(self) {
        let state = self.state;
        for undo in self.journal.into_iter().rev() {
            match undo {
                Undo::Record {
                    model,
                    id,
                    previous,
                } => restore(&mut state.records, model, id, previous),
                Undo::Metadata {
                    model,
                    id,
                    previous,
                } => restore(&mut state.metadata, model, id, previous),
                Undo::Mutation { sequence, previous } => match previous {
                    Some(event) => {
                        state.outbox.insert(sequence, event);
                    }
                    None => {
                        state.outbox.remove(&sequence);
                    }
                },
                Undo::Checkpoint { model, previous } => match previous {
                    Some(at) => {
                        state.checkpoints.insert(model, at);
                    }
                    None => {
                        state.checkpoints.remove(&model);
                    }
                },
                Undo::NextSequence(sequence) => state.next_sequence = sequence,
            }
        }
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn record(&self, model: &str, id: &str) -> Option<Record> {
        self.state.get_record(model, id).cloned()
    }

    fn metadata(&self, model: &str, id: &str) -> Option<SyncMetadata> {
        self.state.get_metadata(model, id).cloned()
    }

    fn mutations(&self) -> Vec<MutationEvent> {
        self.state.outbox.values().cloned().collect()
    }

    fn mutations_for(&self, model: &str, id: &str) -> Vec<MutationEvent> {
        self.state.mutations_for(model, id).cloned().collect()
    }

    fn checkpoint(&self, model: &str) -> Option<Timestamp> {
        self.state.checkpoints.get(model).copied()
    }

    fn save(&mut self, record: Record) {
        let previous = self
            .state
            .records
            .entry(record.model.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        self.journal.push(Undo::Record {
            model: record.model,
            id: record.id,
            previous,
        });
    }

    fn delete(&mut self, model: &str, id: &str) -> Option<Record> {
        let records = self.state.records.get_mut(model)?;
        let previous = records.remove(id)?;
        if records.is_empty() {
            self.state.records.remove(model);
        }
        self.journal.push(Undo::Record {
            model: model.to_string(),
            id: id.to_string(),
            previous: Some(previous.clone()),
        });
        Some(previous)
    }

    fn save_metadata(&mut self, metadata: SyncMetadata) {
        let previous = self
            .state
            .metadata
            .entry(metadata.model.clone())
            .or_default()
            .insert(metadata.id.clone(), metadata.clone());
        self.journal.push(Undo::Metadata {
            model: metadata.model,
            id: metadata.id,
            previous,
        });
    }

    fn append_mutation(&mut self, mut event: MutationEvent) -> Sequence {
        let sequence = self.state.next_sequence;
        self.journal.push(Undo::NextSequence(sequence));
        self.state.next_sequence = sequence + 1;

        event.sequence = sequence;
        let previous = self.state.outbox.insert(sequence, event);
        self.journal.push(Undo::Mutation { sequence, previous });
        sequence
    }

    fn update_mutation(&mut self, event: MutationEvent) -> Result<()> {
        let sequence = event.sequence;
        let slot = self.state.outbox.get_mut(&sequence).ok_or_else(|| {
            Error::Storage(format!("no outbox entry with sequence {sequence}"))
        })?;
        let previous = std::mem::replace(slot, event);
        self.journal.push(Undo::Mutation {
            sequence,
            previous: Some(previous),
        });
        Ok(())
    }

    fn remove_mutation(&mut self, sequence: Sequence) -> Option<MutationEvent> {
        let previous = self.state.outbox.remove(&sequence)?;
        self.journal.push(Undo::Mutation {
            sequence,
            previous: Some(previous.clone()),
        });
        Some(previous)
    }

    fn set_checkpoint(&mut self, model: &str, at: Timestamp) {
        let previous = self.state.checkpoints.insert(model.to_string(), at);
        self.journal.push(Undo::Checkpoint {
            model: model.to_string(),
            previous,
        });
    }
}

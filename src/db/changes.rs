//! Change batches emitted after each committed save.

use std::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Photo ids of one pin touched by a single committed save, in mutation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoChanges {
    pub pin_id: i64,
    pub inserted: Vec<i64>,
    pub updated: Vec<i64>,
    pub deleted: Vec<i64>,
}

impl PhotoChanges {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Mutations recorded since the last successful commit.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    entries: Vec<(i64, i64, ChangeKind)>,
}

impl ChangeSet {
    pub fn record(&mut self, pin_id: i64, photo_id: i64, kind: ChangeKind) {
        match kind {
            ChangeKind::Insert => self.entries.push((pin_id, photo_id, kind)),
            ChangeKind::Update => {
                // An insert or earlier update already makes the row show up fresh
                if !self.entries.iter().any(|(_, id, _)| *id == photo_id) {
                    self.entries.push((pin_id, photo_id, kind));
                }
            }
            ChangeKind::Delete => {
                let inserted_here = self
                    .entries
                    .iter()
                    .any(|(_, id, k)| *id == photo_id && *k == ChangeKind::Insert);
                self.entries.retain(|(_, id, _)| *id != photo_id);
                if !inserted_here {
                    self.entries.push((pin_id, photo_id, kind));
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn batch_for(&self, pin_id: i64) -> Option<PhotoChanges> {
        let mut batch = PhotoChanges {
            pin_id,
            ..Default::default()
        };
        for (pin, photo, kind) in &self.entries {
            if *pin != pin_id {
                continue;
            }
            match kind {
                ChangeKind::Insert => batch.inserted.push(*photo),
                ChangeKind::Update => batch.updated.push(*photo),
                ChangeKind::Delete => batch.deleted.push(*photo),
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

pub(crate) struct Subscriber {
    pub pin_id: i64,
    pub tx: mpsc::Sender<PhotoChanges>,
}

/// Deliver one batch per interested subscriber, dropping subscribers whose
/// receiver has gone away.
pub(crate) fn publish(subscribers: &mut Vec<Subscriber>, changes: &ChangeSet) {
    subscribers.retain(|sub| match changes.batch_for(sub.pin_id) {
        Some(batch) => sub.tx.send(batch).is_ok(),
        None => true,
    });
}

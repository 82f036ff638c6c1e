use std::collections::HashMap;

use crate::types::ChangeAction;

/// The poller's last-observed view of a pair's Sheet side:
/// `external_id → fingerprint`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: HashMap<String, String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&str> {
        self.entries.get(external_id).map(String::as_str)
    }

    pub fn insert(&mut self, external_id: impl Into<String>, fingerprint: impl Into<String>) {
        self.entries.insert(external_id.into(), fingerprint.into());
    }

    pub fn remove(&mut self, external_id: &str) -> Option<String> {
        self.entries.remove(external_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Compare a full Sheet read against the snapshot.
///
/// `current` is `(external_id, fingerprint)` in the order the Sheet returned
/// the records. Creates and updates come back in that order; deletes (ids in
/// the snapshot that were not seen) come last. Records whose fingerprint
/// matches the snapshot produce nothing.
pub fn diff(current: &[(String, String)], snapshot: &Snapshot) -> Vec<(ChangeAction, String)> {
    let mut changes = Vec::new();
    let mut seen = std::collections::HashSet::with_capacity(current.len());

    for (external_id, fp) in current {
        seen.insert(external_id.as_str());
        match snapshot.get(external_id) {
            None => changes.push((ChangeAction::Insert, external_id.clone())),
            Some(known) if known != fp => {
                changes.push((ChangeAction::Update, external_id.clone()))
            }
            Some(_) => {}
        }
    }

    for (external_id, _) in snapshot.entries() {
        if !seen.contains(external_id) {
            changes.push((ChangeAction::Delete, external_id.to_string()));
        }
    }

    changes
}

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    fn transcript_label(self) -> &'static str {
        match self {
            Self::User => "[User]",
            Self::Model => "[Model]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
}

/// Per-identity exchange log.
///
/// Stored as a flat list whose even positions are prompts and odd positions
/// are model responses; the list length is always even.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: Mutex<BTreeMap<String, Vec<String>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Vec<Utterance> {
        self.lock()
            .get(identity)
            .map(|lines| {
                lines
                    .iter()
                    .enumerate()
                    .map(|(index, text)| Utterance {
                        role: if index % 2 == 0 { Role::User } else { Role::Model },
                        text: text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn append(&self, identity: &str, prompt: &str, response: &str) {
        let mut entries = self.lock();
        let lines = entries.entry(identity.to_string()).or_default();
        lines.reserve(2);
        lines.push(prompt.to_string());
        lines.push(response.to_string());
    }

    pub fn clear(&self, identity: &str) {
        self.lock().insert(identity.to_string(), Vec::new());
    }

    pub fn len(&self, identity: &str) -> usize {
        self.lock().get(identity).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, identity: &str) -> bool {
        self.len(identity) == 0
    }

    /// Plain-text transcript, `None` when there is nothing to export.
    pub fn transcript(&self, identity: &str) -> Option<String> {
        let utterances = self.get(identity);
        if utterances.is_empty() {
            return None;
        }
        let mut out = String::new();
        for utterance in utterances {
            out.push_str(utterance.role.transcript_label());
            out.push_str(":\n");
            out.push_str(&utterance.text);
            out.push_str("\n\n");
        }
        Some(out)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.lock().clone()
    }

    pub fn restore(&self, mut snapshot: BTreeMap<String, Vec<String>>) {
        for (identity, lines) in snapshot.iter_mut() {
            if lines.len() % 2 != 0 {
                tracing::warn!(
                    identity = identity.as_str(),
                    "dropping unpaired trailing history entry"
                );
                lines.pop();
            }
        }
        *self.lock() = snapshot;
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    use super::{HistoryStore, Role};

    #[test]
    fn append_adds_exactly_one_pair() {
        let store = HistoryStore::new();
        store.append("u-1", "hi", "hello");
        store.append("u-1", "how are you", "fine");
        let history = store.get("u-1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Model);
        assert_eq!(history[3].text, "fine");
    }

    #[test]
    fn clear_resets_to_empty() {
        let store = HistoryStore::new();
        store.append("g-1", "a", "b");
        store.clear("g-1");
        assert_eq!(store.len("g-1"), 0);
        assert!(store.get("g-1").is_empty());
        assert!(store.transcript("g-1").is_none());
    }

    #[test]
    fn unknown_identity_is_empty() {
        assert!(HistoryStore::new().get("nobody").is_empty());
    }

    #[test]
    fn concurrent_appends_keep_length_even() {
        let store = Arc::new(HistoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for turn in 0..25 {
                        store.append("shared", &format!("p{idx}-{turn}"), &format!("r{idx}-{turn}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let history = store.get("shared");
        assert_eq!(history.len(), 400);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].text.replacen('p', "r", 1), pair[1].text);
        }
    }

    #[test]
    fn transcript_labels_speakers() {
        let store = HistoryStore::new();
        store.append("u-1", "ping", "pong");
        assert_eq!(
            store.transcript("u-1").as_deref(),
            Some("[User]:\nping\n\n[Model]:\npong\n\n")
        );
    }

    #[test]
    fn restore_drops_unpaired_tail() {
        let store = HistoryStore::new();
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "u-1".to_string(),
            vec!["a".to_string(), "b".to_string(), "dangling".to_string()],
        );
        store.restore(snapshot);
        assert_eq!(store.len("u-1"), 2);
    }
}

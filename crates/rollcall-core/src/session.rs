use std::collections::HashSet;

/// Identities already recorded during the current recognition run.
///
/// Purely in-memory; cleared whenever the recognition loop (re)starts so
/// the same person can be recorded again in the next run.
#[derive(Debug, Default)]
pub struct SessionTracker {
    seen: HashSet<String>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    /// Returns `true` if the identity was not yet marked.
    pub fn mark(&mut self, identity: &str) -> bool {
        self.seen.insert(identity.to_string())
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Marked identities in sorted order.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.seen.iter().cloned().collect();
        ids.sort();
        ids
    }
}

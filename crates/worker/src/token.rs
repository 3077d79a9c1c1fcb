use std::sync::{Mutex, MutexGuard};

/// Holds the one-time pairing secret for this worker.
///
/// The first successful registration wins for the rest of the process
/// lifetime, so a second UI cannot take over an already paired worker.
#[derive(Debug, Default)]
pub struct TokenService {
    token: Mutex<Option<String>>,
}

impl TokenService {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `candidate` if no token has been registered yet.
    /// Empty candidates are never stored.
    pub fn register_token(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return false;
        }

        let mut slot = self.slot();
        if slot.is_some() {
            return false;
        }

        *slot = Some(candidate.to_string());
        true
    }

    pub fn is_token_set(&self) -> bool {
        self.slot().is_some()
    }

    pub fn is_authenticated(&self, presented: Option<&str>) -> bool {
        let presented = match presented {
            Some(p) if !p.is_empty() => p,
            _ => return false,
        };

        match self.slot().as_deref() {
            Some(stored) => !stored.is_empty() && stored == presented,
            None => false,
        }
    }
}

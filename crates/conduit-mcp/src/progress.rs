//! Routes `notifications/progress` to the caller that asked for it.

use conduit_types::{ProgressParams, ProgressToken};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Called with `(progress, total)` for each progress notification.
pub type ProgressHandler = Arc<dyn Fn(f64, Option<f64>) + Send + Sync>;

/// Token -> handler table. Owned and mutated by a single connection task.
#[derive(Default)]
pub struct ProgressRouter {
    handlers: HashMap<ProgressToken, ProgressHandler>,
}

impl fmt::Debug for ProgressRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressRouter")
            .field("tokens", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProgressRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token, unique among in-flight requests.
    pub fn mint_token() -> ProgressToken {
        ProgressToken::String(uuid::Uuid::new_v4().to_string())
    }

    /// Returns `false` (and keeps the existing handler) if the token is taken.
    pub fn register(&mut self, token: ProgressToken, handler: ProgressHandler) -> bool {
        if self.handlers.contains_key(&token) {
            tracing::warn!("Progress token {token} is already registered");
            return false;
        }
        self.handlers.insert(token, handler);
        true
    }

    pub fn retire(&mut self, token: &ProgressToken) -> bool {
        self.handlers.remove(token).is_some()
    }

    /// Invoke the handler for this notification's token, if one is registered.
    pub fn dispatch(&self, params: &ProgressParams) -> bool {
        match self.handlers.get(&params.progress_token) {
            Some(handler) => {
                handler(params.progress, params.total);
                true
            }
            None => {
                tracing::trace!("Ignoring progress for unknown token {}", params.progress_token);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (ProgressHandler, Arc<Mutex<Vec<(f64, Option<f64>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ProgressHandler = Arc::new(move |p, t| sink.lock().unwrap().push((p, t)));
        (handler, seen)
    }

    fn progress(token: &ProgressToken, progress: f64, total: Option<f64>) -> ProgressParams {
        ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            meta: None,
        }
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(ProgressRouter::mint_token(), ProgressRouter::mint_token());
    }

    #[test]
    fn dispatch_reaches_only_matching_handler() {
        let mut router = ProgressRouter::new();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        let token_a = ProgressRouter::mint_token();
        let token_b = ProgressRouter::mint_token();
        assert!(router.register(token_a.clone(), a));
        assert!(router.register(token_b.clone(), b));

        assert!(router.dispatch(&progress(&token_a, 1.0, Some(4.0))));
        assert!(router.dispatch(&progress(&token_a, 2.0, Some(4.0))));
        assert!(!router.dispatch(&progress(&ProgressToken::Number(99), 1.0, None)));

        assert_eq!(*seen_a.lock().unwrap(), vec![(1.0, Some(4.0)), (2.0, Some(4.0))]);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn retired_token_is_ignored() {
        let mut router = ProgressRouter::new();
        let (handler, seen) = recorder();
        let token = ProgressToken::Number(1);
        router.register(token.clone(), handler);
        assert!(router.retire(&token));
        assert!(!router.retire(&token));
        assert!(!router.dispatch(&progress(&token, 1.0, None)));
        assert!(seen.lock().unwrap().is_empty());
        assert!(router.is_empty());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut router = ProgressRouter::new();
        let (first, seen_first) = recorder();
        let (second, _) = recorder();
        let token = ProgressToken::String("t".into());
        assert!(router.register(token.clone(), first));
        assert!(!router.register(token.clone(), second));
        router.dispatch(&progress(&token, 0.5, None));
        assert_eq!(seen_first.lock().unwrap().len(), 1);
        assert_eq!(router.len(), 1);
    }
}

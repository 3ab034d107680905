//! Process-wide state: the transport library refcount and the session registry.
//!
//! Callbacks that the transport library makes during a raw call (keyboard
//! interactive prompts) carry a [`SessionToken`] instead of a pointer back to
//! the session; the registry resolves the token to the session's observer
//! and event queue.

use crate::observer::{EventQueue, SessionEvent, SessionObserver};
use burrow_transport::{Prompt, PromptResponder, RawResult};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Opaque handle identifying a live session in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

struct Entry {
    observer: Arc<dyn SessionObserver>,
    events: EventQueue,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionToken, Entry>,
    libraries: HashMap<TypeId, usize>,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Registry entry for one session; unregisters on drop
pub(crate) struct Registration {
    token: SessionToken,
}

impl Registration {
    /// Register a session's observer and event queue
    pub(crate) fn register(observer: Arc<dyn SessionObserver>, events: EventQueue) -> Self {
        let token = SessionToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        registry()
            .sessions
            .insert(token, Entry { observer, events });
        debug!("Registered {}", token);
        Self { token }
    }

    pub(crate) fn token(&self) -> SessionToken {
        self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        registry().sessions.remove(&self.token);
        debug!("Unregistered {}", self.token);
    }
}

fn lookup(token: SessionToken) -> Option<(Arc<dyn SessionObserver>, EventQueue)> {
    registry()
        .sessions
        .get(&token)
        .map(|entry| (entry.observer.clone(), entry.events.clone()))
}

/// Ask the session's observer whether to trust a host key
pub(crate) fn verify_host_key(token: SessionToken, fingerprint: &str) -> bool {
    match lookup(token) {
        Some((observer, _)) => observer.verify_host_key(fingerprint),
        None => {
            warn!("{} is not registered; refusing host key", token);
            false
        }
    }
}

/// Answers keyboard-interactive prompts through the registry
pub(crate) struct RegistryPrompter {
    token: SessionToken,
}

impl RegistryPrompter {
    pub(crate) fn new(token: SessionToken) -> Self {
        Self { token }
    }
}

impl PromptResponder for RegistryPrompter {
    fn respond(&mut self, username: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String> {
        let Some((observer, events)) = lookup(self.token) else {
            warn!("{} is not registered; answering prompts empty", self.token);
            return vec![String::new(); prompts.len()];
        };

        events.session(SessionEvent::Debug(format!(
            "keyboard-interactive: {} prompt(s){}",
            prompts.len(),
            if instructions.is_empty() {
                String::new()
            } else {
                format!(", {}", instructions)
            }
        )));

        prompts
            .iter()
            .map(|prompt| observer.keyboard_interactive(username, prompt))
            .collect()
    }
}

/// Keeps a transport library initialised while held.
///
/// The first reference for a library runs its init hook; dropping the last one
/// runs its shutdown hook.
pub(crate) struct LibraryRef {
    key: TypeId,
    shutdown: fn(),
}

impl LibraryRef {
    /// Take a reference on the library identified by `key`
    pub(crate) fn acquire(key: TypeId, init: fn() -> RawResult<()>, shutdown: fn()) -> RawResult<Self> {
        let mut registry = registry();
        let count = registry.libraries.entry(key).or_insert(0);
        if *count == 0 {
            init()?;
        }
        *count += 1;
        Ok(Self { key, shutdown })
    }

    #[cfg(test)]
    fn count(key: TypeId) -> usize {
        registry().libraries.get(&key).copied().unwrap_or(0)
    }
}

impl Drop for LibraryRef {
    fn drop(&mut self) {
        let mut registry = registry();
        let last = match registry.libraries.get_mut(&self.key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if last {
            registry.libraries.remove(&self.key);
            drop(registry);
            (self.shutdown)();
        }
    }
}

//! Scoped, stack-based configuration.
//!
//! Every other component in this crate reads its parameters from here rather than taking
//! them as explicit arguments. The active configuration is a stack of [`Frame`]s held in a
//! `thread_local!` cell: writes are only legal while at least one frame beyond the root is
//! on the stack, and leaving a frame always restores the exact mapping that was visible
//! before it was entered, regardless of how the frame's scope exits.
//!
//! This stack is deliberately not behind a lock. Concurrent use of the Config Scope across
//! threads within a single process is not supported; each OS thread gets its own
//! independent stack, and the parallel runner relies on that by forking rather than
//! spawning threads (see [`crate::parallel`]).

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::session::Session;

/// A single configuration value. Anything that can be stored under a configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// A boolean flag, e.g. `use_shell`, `quiet`.
    Bool(bool),
    /// A signed integer, e.g. a return code override.
    Int(i64),
    /// An unsigned integer, e.g. `port`.
    UInt(u64),
    /// A floating point number, e.g. `timeout` in seconds.
    Float(f64),
    /// A string, e.g. `host_string`, `user`.
    Str(String),
    /// A filesystem path, e.g. `key_filename`.
    Path(String),
    /// A list of strings, e.g. a list of hosts.
    StrList(Vec<String>),
}

impl ConfigValue {
    /// Returns this value as a `&str`, if it is one of the string-shaped variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) | ConfigValue::Path(s) => Some(s),
            _ => None,
        }
    }

    /// Returns this value as a `bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns this value as a `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt(n) => Some(*n),
            ConfigValue::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Returns this value as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(n) => Some(*n as f64),
            ConfigValue::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Returns this value as a list of strings.
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::StrList(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<u64> for ConfigValue {
    fn from(n: u64) -> Self {
        ConfigValue::UInt(n)
    }
}

impl From<u16> for ConfigValue {
    fn from(n: u16) -> Self {
        ConfigValue::UInt(n as u64)
    }
}

impl From<f64> for ConfigValue {
    fn from(f: f64) -> Self {
        ConfigValue::Float(f)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(v: Vec<String>) -> Self {
        ConfigValue::StrList(v)
    }
}

/// The mapping a configuration frame holds: every key currently visible in a scope.
pub type ConfigMap = HashMap<String, ConfigValue>;

// Not `Send`: a cleanup can own an `Rc`-based handle (e.g. a cached session), and this
// whole stack is already documented as single-threaded — see the module doc comment.
type Cleanup = Box<dyn FnOnce()>;

/// A serializable snapshot of the topmost frame's mapping, used to hand configuration
/// across the fork boundary into a parallel worker (see [`crate::parallel`]).
///
/// Live SSH sessions are never part of a snapshot — they aren't serializable, and a
/// session handle from one process is meaningless in another. A forked worker starts with
/// an empty session cache and reconnects on first use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub(crate) values: ConfigMap,
}

impl Snapshot {
    /// Builds a snapshot from a plain map, typically the current scope's values.
    pub fn new(values: ConfigMap) -> Self {
        Snapshot { values }
    }
}

struct Frame {
    values: ConfigMap,
    cleanups: Vec<Cleanup>,
    // Shared so a cleanup registered by `cache_session` can hold its own handle to this
    // same map and remove its entry at the point it runs, rather than this frame's drop
    // order being the thing that decides when a session disconnects.
    sessions: Rc<RefCell<HashMap<SessionKey, Rc<Session>>>>,
    writable: bool,
}

impl Frame {
    fn root() -> Self {
        Frame {
            values: ConfigMap::new(),
            cleanups: Vec::new(),
            sessions: Rc::new(RefCell::new(HashMap::new())),
            writable: false,
        }
    }
}

/// Key under which an established SSH session is cached for the lifetime of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey {
    pub user: Option<String>,
    pub host: String,
    pub key_filename: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<u64>,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = RefCell::new(vec![Frame::root()]);
}

/// Returns `true` if a [`ScopedContext`] is currently active on this thread.
pub fn in_scope() -> bool {
    STACK.with(|s| s.borrow().len() > 1)
}

/// Replaces the root frame's values. Only permitted when no scope is active.
pub fn set_defaults(values: ConfigMap) -> Result<(), Error> {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        if stack.len() != 1 {
            return Err(Error::usage(
                "set_defaults can only be called outside any active scope",
            ));
        }
        stack[0].values = values;
        Ok(())
    })
}

/// Reads a single key from the current (topmost) frame.
pub fn get(key: &str) -> Option<ConfigValue> {
    STACK.with(|s| s.borrow().last().unwrap().values.get(key).cloned())
}

/// Returns a clone of the entire current (topmost) frame's mapping.
pub fn current_map() -> ConfigMap {
    STACK.with(|s| s.borrow().last().unwrap().values.clone())
}

/// Sets a single key in the current frame. Fails outside any active scope.
pub fn set(key: impl Into<String>, value: impl Into<ConfigValue>) -> Result<(), Error> {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let top = stack.last_mut().unwrap();
        if !top.writable {
            return Err(Error::usage(format!(
                "cannot write key {:?} outside an active scope",
                key.into()
            )));
        }
        top.values.insert(key.into(), value.into());
        Ok(())
    })
}

/// Registers `cleanup` to run once, in FIFO order with other cleanups of the same frame,
/// when the current scope exits. Fails outside any active scope.
pub fn add_cleanup(cleanup: impl FnOnce() + 'static) -> Result<(), Error> {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let top = stack.last_mut().unwrap();
        if !top.writable {
            return Err(Error::usage("add_cleanup called outside an active scope"));
        }
        top.cleanups.push(Box::new(cleanup));
        Ok(())
    })
}

pub(crate) fn cached_session(key: &SessionKey) -> Option<Rc<Session>> {
    STACK.with(|s| s.borrow().last().unwrap().sessions.borrow().get(key).cloned())
}

/// Caches `session` under `key` in the current frame and registers its disconnect as a
/// cleanup at this same point, so it tears down in FIFO order relative to every other
/// cleanup registered in this scope, rather than always after all of them.
pub(crate) fn cache_session(key: SessionKey, session: Rc<Session>) {
    let sessions = STACK.with(|s| {
        let stack = s.borrow();
        let top = stack.last().unwrap();
        top.sessions.borrow_mut().insert(key.clone(), session);
        Rc::clone(&top.sessions)
    });
    // Outside any active scope this can't be reached (callers only cache a session while
    // `in_scope()` holds), so a registration failure here would mean a real bug elsewhere.
    let _ = add_cleanup(move || {
        sessions.borrow_mut().remove(&key);
    });
}

/// A live configuration scope, entered by [`settings`]. Leaving it (via `Drop`) always
/// restores the prior mapping and runs this frame's cleanups first, regardless of whether
/// the scope is left normally or via unwinding.
pub struct ScopedContext {
    // Always `Some` until `Drop` runs; `Drop` takes it to avoid double-running.
    _private: (),
}

impl std::fmt::Debug for ScopedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedContext").finish()
    }
}

/// Enters a new configuration scope, patched with `overrides` over the currently visible
/// mapping. The scope lasts until the returned [`ScopedContext`] is dropped.
///
/// ```no_run
/// use hostwork::config::{self, ConfigValue};
///
/// let overrides = [("use_shell".to_string(), ConfigValue::Bool(true))].into();
/// let _scope = config::settings(overrides);
/// assert_eq!(config::get("use_shell"), Some(ConfigValue::Bool(true)));
/// // dropping `_scope` restores the prior mapping
/// ```
pub fn settings(overrides: ConfigMap) -> ScopedContext {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let mut values = stack.last().unwrap().values.clone();
        values.extend(overrides);
        stack.push(Frame {
            values,
            cleanups: Vec::new(),
            sessions: Rc::new(RefCell::new(HashMap::new())),
            writable: true,
        });
    });
    ScopedContext { _private: () }
}

impl Drop for ScopedContext {
    fn drop(&mut self) {
        let frame = STACK.with(|s| s.borrow_mut().pop());
        let Some(mut frame) = frame else {
            return;
        };

        let mut first_panic = None;
        for cleanup in frame.cleanups.drain(..) {
            let result = panic::catch_unwind(AssertUnwindSafe(cleanup));
            if let Err(payload) = result {
                tracing::warn!("cleanup callback panicked while leaving a config scope");
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }

        // Every cached session's disconnect was registered as a cleanup at `cache_session`
        // time, so the loop above already drained `frame.sessions` in FIFO order; this just
        // drops the (now-empty, or orphaned-on-panic) map along with the rest of the frame.
        drop(frame.sessions);

        if let Some(payload) = first_panic {
            if !std::thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_stack_for_test() {
        STACK.with(|s| *s.borrow_mut() = vec![Frame::root()]);
    }

    #[test]
    fn write_outside_scope_fails() {
        clear_stack_for_test();
        assert!(set("foo", "bar").is_err());
    }

    #[test]
    fn nested_scopes_restore_exactly() {
        clear_stack_for_test();
        {
            let _a = settings([("foo".to_string(), ConfigValue::from("bar"))].into());
            {
                let _b = settings([("bar".to_string(), ConfigValue::from("baz"))].into());
                {
                    let _c = settings([("baz".to_string(), ConfigValue::from("bup"))].into());
                    let map = current_map();
                    assert_eq!(map.get("foo").unwrap().as_str(), Some("bar"));
                    assert_eq!(map.get("bar").unwrap().as_str(), Some("baz"));
                    assert_eq!(map.get("baz").unwrap().as_str(), Some("bup"));
                }
                assert!(current_map().get("baz").is_none());
            }
            assert!(current_map().get("bar").is_none());
        }
        assert!(current_map().is_empty());
        assert!(!in_scope());
    }

    #[test]
    fn inner_scope_deletion_is_undone_on_exit() {
        clear_stack_for_test();
        let _a = settings([("foo".to_string(), ConfigValue::from("bar"))].into());
        {
            let _b = settings(ConfigMap::new());
            set("foo", "overwritten").unwrap();
            assert_eq!(current_map().get("foo").unwrap().as_str(), Some("overwritten"));
        }
        assert_eq!(current_map().get("foo").unwrap().as_str(), Some("bar"));
    }

    #[test]
    fn cleanup_runs_fifo_on_exit() {
        use pretty_assertions::assert_eq;

        clear_stack_for_test();
        use std::sync::{Arc, Mutex};
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let _scope = settings(ConfigMap::new());
            let o1 = order.clone();
            add_cleanup(move || o1.lock().unwrap().push(1)).unwrap();
            let o2 = order.clone();
            add_cleanup(move || o2.lock().unwrap().push(2)).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    /// Mirrors the shape of `cache_session`: a resource lives in a map keyed by a handle,
    /// and its teardown is registered as a cleanup at the point it's cached, rather than
    /// the map being dropped separately after all other cleanups run. Exercised here with a
    /// plain `Rc<RefCell<_>>` resource since `Session` itself needs a real `ssh` binary to
    /// construct.
    #[test]
    fn cached_resource_cleanup_interleaves_with_other_cleanups_in_registration_order() {
        clear_stack_for_test();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let _scope = settings(ConfigMap::new());

            let o1 = order.clone();
            add_cleanup(move || o1.borrow_mut().push(1)).unwrap();

            let resources: Rc<RefCell<HashMap<&'static str, Rc<i32>>>> =
                Rc::new(RefCell::new(HashMap::new()));
            resources.borrow_mut().insert("conn", Rc::new(42));
            let handle = Rc::clone(&resources);
            let o2 = order.clone();
            add_cleanup(move || {
                handle.borrow_mut().remove("conn");
                o2.borrow_mut().push(2);
            })
            .unwrap();

            let o3 = order.clone();
            add_cleanup(move || o3.borrow_mut().push(3)).unwrap();
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }
}

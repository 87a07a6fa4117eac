//! QuickJS runtime ownership and context entry tracking
//!
//! One [`Engine`] owns one `rquickjs::Runtime` plus the host context, which
//! holds the host's true global object. Isolated contexts created for
//! sandboxes live in the same runtime so that sandbox objects can be shared
//! with them.

use crate::config::ContextifyConfig;
use crate::error::{ContextifyError, Result};
use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Runtime};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Identifier of a sandbox context within its engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Numeric value of the id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct EngineInner {
    host: Context,
    runtime: Runtime,
    config: ContextifyConfig,
    active: RefCell<Vec<ContextId>>,
    next_id: Cell<u64>,
}

/// Shared handle to a QuickJS runtime
///
/// Cloning is cheap. The runtime is dropped with the last clone, which is
/// always after every [`crate::SandboxContext`] built on it.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl Engine {
    /// Create a runtime and host context configured by `config`
    pub fn new(config: ContextifyConfig) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| ContextifyError::engine(format!("Failed to create JS runtime: {}", e)))?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }

        let host = Context::full(&runtime)
            .map_err(|e| ContextifyError::engine(format!("Failed to create JS context: {}", e)))?;

        tracing::debug!(
            memory_limit = ?config.memory_limit,
            max_stack_size = ?config.max_stack_size,
            "JS engine created"
        );

        Ok(Self {
            inner: Rc::new(EngineInner {
                host,
                runtime,
                config,
                active: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        })
    }

    /// Create an engine with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(ContextifyConfig::default())
    }

    /// Configuration this engine was created with
    pub fn config(&self) -> &ContextifyConfig {
        &self.inner.config
    }

    /// Run `f` in the host context
    pub fn with_host<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.inner.host.with(f)
    }

    /// Context currently entered by a `run`, if any
    pub fn active_context(&self) -> Option<ContextId> {
        self.inner.active.borrow().last().copied()
    }

    /// Create a fresh isolated `rquickjs` context in this runtime
    pub(crate) fn new_context(&self) -> Result<Context> {
        Context::full(&self.inner.runtime)
            .map_err(|e| ContextifyError::engine(format!("Failed to create JS context: {}", e)))
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        ContextId(id)
    }

    /// Make `id` the active context until the returned guard is dropped
    pub(crate) fn enter(&self, id: ContextId) -> ContextScope<'_> {
        self.inner.active.borrow_mut().push(id);
        tracing::debug!(context = %id, "Entered context");
        ContextScope { engine: self, id }
    }

    /// Run queued promise jobs until the queue is empty
    ///
    /// A job that throws is logged and its exception cleared; the remaining
    /// jobs still run. Returns how many jobs ran.
    pub fn drain_pending_jobs(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.inner.runtime.execute_pending_job() {
                Ok(false) => return ran,
                Ok(true) => ran += 1,
                Err(failed) => {
                    ran += 1;
                    let reason = failed.0.with(|ctx| {
                        let thrown = ctx.catch();
                        match thrown.get::<Coerced<String>>() {
                            Ok(Coerced(reason)) => reason,
                            Err(_) => {
                                let _ = ctx.catch();
                                format!("<{}>", thrown.type_name())
                            }
                        }
                    });
                    tracing::warn!(reason = %reason, "Promise job threw");
                }
            }
        }
    }

    /// Collect unreachable engine objects
    pub(crate) fn run_gc(&self) {
        self.inner.runtime.run_gc();
    }
}

/// Entered-context guard; exits the context on drop
///
/// Exit must find its own context on top of the active stack. Anything else
/// means enter and exit got unpaired, which corrupts every later operation on
/// the runtime, so it is treated as fatal.
pub(crate) struct ContextScope<'e> {
    engine: &'e Engine,
    id: ContextId,
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        let popped = self.engine.inner.active.borrow_mut().pop();
        if popped == Some(self.id) {
            tracing::debug!(context = %self.id, "Exited context");
            return;
        }
        tracing::error!(
            context = %self.id,
            found = ?popped,
            "Context exit does not match context entry"
        );
        if !std::thread::panicking() {
            panic!(
                "internal invariant violation: exiting context {} but {:?} was active",
                self.id, popped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let engine = Engine::with_defaults().unwrap();
        let a = engine.next_context_id();
        let b = engine.next_context_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_scope_pairs_enter_and_exit() {
        let engine = Engine::with_defaults().unwrap();
        let outer = engine.next_context_id();
        let inner = engine.next_context_id();

        assert_eq!(engine.active_context(), None);
        {
            let _outer = engine.enter(outer);
            assert_eq!(engine.active_context(), Some(outer));
            {
                let _inner = engine.enter(inner);
                assert_eq!(engine.active_context(), Some(inner));
            }
            assert_eq!(engine.active_context(), Some(outer));
        }
        assert_eq!(engine.active_context(), None);
    }

    #[test]
    #[should_panic(expected = "internal invariant violation")]
    fn test_unpaired_exit_is_fatal() {
        let engine = Engine::with_defaults().unwrap();
        let first = engine.next_context_id();
        let second = engine.next_context_id();

        let first_scope = engine.enter(first);
        let _second_scope = engine.enter(second);
        // Exiting the outer context while the inner one is still active
        drop(first_scope);
    }

    #[test]
    fn test_host_context_evaluates() {
        let engine = Engine::with_defaults().unwrap();
        let sum: i32 = engine.with_host(|ctx| ctx.eval("20 + 22")).unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn test_drain_runs_promise_jobs() {
        let engine = Engine::with_defaults().unwrap();
        engine
            .with_host(|ctx| {
                ctx.eval::<(), _>("Promise.resolve(5).then(v => { globalThis.settled = v; });")
            })
            .unwrap();
        assert_eq!(engine.drain_pending_jobs(), 1);
        let settled: i32 = engine.with_host(|ctx| ctx.globals().get("settled")).unwrap();
        assert_eq!(settled, 5);
    }
}

//! Host-facing sandbox context
//!
//! A [`SandboxContext`] owns one isolated context, its synthetic global and a
//! reference to the sandbox object. All creation goes through
//! [`SandboxContext::new`], which delegates to the context factory.
//!
//! # Example
//!
//! ```rust,no_run
//! use contextify::{Engine, SandboxContext};
//! use serde_json::json;
//!
//! # fn example() -> contextify::Result<()> {
//! let engine = Engine::with_defaults()?;
//! let mut context = SandboxContext::from_json(&engine, json!({ "count": 1 }))?;
//!
//! context.run("count += 1; total = count * 10", None)?;
//! assert_eq!(context.sandbox_json()?, json!({ "count": 2, "total": 20 }));
//!
//! context.destroy();
//! # Ok(())
//! # }
//! ```

use crate::bridge;
use crate::engine::{ContextId, Engine};
use crate::error::{ContextifyError, Result};
use crate::factory::{create_context, CreatedContext, IsolatedContext};
use crate::handle::Handle;
use crate::runner::run_script;
use rquickjs::{Object, Persistent, Value};

struct LiveContext {
    isolated: IsolatedContext,
    global_proxy: Persistent<Object<'static>>,
    sandbox: Persistent<Value<'static>>,
}

/// An isolated execution context whose global scope is the sandbox object
pub struct SandboxContext {
    id: ContextId,
    engine: Engine,
    live: Option<LiveContext>,
}

impl SandboxContext {
    /// Build a context around `sandbox`
    ///
    /// Fails with [`ContextifyError::Construction`] if `sandbox` is not an
    /// object.
    pub fn new(engine: &Engine, sandbox: Persistent<Value<'static>>) -> Result<Self> {
        let CreatedContext {
            isolated,
            global_proxy,
        } = create_context(engine, &sandbox)?;
        let id = engine.next_context_id();

        tracing::debug!(context = %id, "Sandbox context constructed");

        Ok(Self {
            id,
            engine: engine.clone(),
            live: Some(LiveContext {
                isolated,
                global_proxy,
                sandbox,
            }),
        })
    }

    /// Build a sandbox object from JSON in the host context, then a context
    /// around it
    pub fn from_json(engine: &Engine, sandbox: serde_json::Value) -> Result<Self> {
        let sandbox = engine.with_host(|ctx| -> Result<_> {
            let value = bridge::json_to_js(&ctx, &sandbox)?;
            Ok(Persistent::save(&ctx, value))
        })?;
        Self::new(engine, sandbox)
    }

    /// Identifier of this context within its engine
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Engine this context lives in
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Handle to the synthetic global object
    ///
    /// The same object is returned on every call for the context's lifetime.
    pub fn global(&self) -> Result<Handle<Object<'static>>> {
        Ok(Handle::new(&self.engine, self.live()?.global_proxy.clone()))
    }

    /// The sandbox object this context routes global-scope effects to
    pub fn sandbox(&self) -> Result<Handle<Value<'static>>> {
        Ok(Handle::new(&self.engine, self.live()?.sandbox.clone()))
    }

    /// Compile and execute `source` with the sandbox as its global scope
    ///
    /// Returns the completion value. A syntax error is reported as
    /// [`ContextifyError::Compile`]; anything the script throws is reported as
    /// [`ContextifyError::Thrown`] carrying the thrown value itself. The context
    /// stays usable after either.
    pub fn run(
        &mut self,
        source: &str,
        filename: Option<&str>,
    ) -> Result<Handle<Value<'static>>> {
        let live = self.live()?;
        let filename = self.engine.config().filename_label(filename);
        run_script(&self.engine, self.id, &live.isolated, source, filename)
    }

    /// [`run`](Self::run) and convert the completion value to JSON
    pub fn run_json(
        &mut self,
        source: &str,
        filename: Option<&str>,
    ) -> Result<serde_json::Value> {
        let value = self.run(source, filename)?;
        let live = self.live()?;
        live.isolated.context.with(|ctx| {
            let value = value.restore(&ctx)?;
            bridge::js_to_json(&ctx, value)
        })
    }

    /// Snapshot of the sandbox object as JSON
    pub fn sandbox_json(&self) -> Result<serde_json::Value> {
        let sandbox = self.sandbox()?;
        self.engine.with_host(|ctx| {
            let value = sandbox.restore(&ctx)?;
            bridge::js_to_json(&ctx, value)
        })
    }

    /// Release the isolated context and every handle it holds
    ///
    /// The isolated context goes first, then the synthetic global, then the
    /// sandbox reference. Calling this again is a no-op.
    pub fn destroy(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };

        let LiveContext {
            isolated,
            global_proxy,
            sandbox,
        } = live;
        drop(isolated);
        drop(global_proxy);
        drop(sandbox);
        self.engine.run_gc();

        tracing::debug!(context = %self.id, "Sandbox context destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.live.is_none()
    }

    fn live(&self) -> Result<&LiveContext> {
        self.live
            .as_ref()
            .ok_or(ContextifyError::Destroyed { id: self.id })
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

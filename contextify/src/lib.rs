//! Isolated script contexts backed by a host-owned sandbox object
//!
//! This crate runs JavaScript (QuickJS-NG, through rquickjs) against a
//! caller-supplied sandbox object instead of the engine's real global object.
//! Built-ins stay reachable, but every global-scope write, delete and
//! enumeration lands on the sandbox, where the host can inspect it.
//!
//! # Architecture
//!
//! - **Engine**: one runtime plus a host context holding the host's true global
//! - **Synthetic global**: a `Proxy` whose traps route through the [`Interceptor`]
//!   to the sandbox first and the isolated context's real global second
//! - **Weak binding**: traps reach their context through a `Weak` token, so the
//!   engine never keeps a destroyed context alive
//! - **Scoped entry**: each `run` enters its context through a guard that exits
//!   on every path, including thrown exceptions
//! - **Handles**: values handed back to the host keep their engine alive
//! - **Service**: [`ContextService`] puts an engine on a dedicated worker thread
//!   for async callers
//!
//! # Example
//!
//! ```rust,no_run
//! use contextify::{ContextifyError, Engine, SandboxContext};
//! use serde_json::json;
//!
//! # fn example() -> contextify::Result<()> {
//! let engine = Engine::with_defaults()?;
//! let mut context = SandboxContext::from_json(&engine, json!({ "limit": 3 }))?;
//!
//! // Built-ins resolve through the real global; writes land in the sandbox
//! context.run("items = Array.from({ length: limit }, (_, i) => i * i)", None)?;
//! assert_eq!(context.sandbox_json()?["items"], json!([0, 1, 4]));
//!
//! // Syntax errors and thrown values are distinct
//! assert!(matches!(context.run("1 +", None), Err(ContextifyError::Compile(_))));
//! assert!(matches!(context.run("throw 7", None), Err(ContextifyError::Thrown(_))));
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handle;
pub mod interceptor;
pub mod service;

mod binding;
mod factory;
mod runner;

pub use binding::SCOPE_BINDING;
pub use config::ContextifyConfig;
pub use context::SandboxContext;
pub use engine::{ContextId, Engine};
pub use error::{CompileError, ContextifyError, ExceptionReport, Result, ThrownException};
pub use handle::Handle;
pub use interceptor::{Interceptor, Lookup, PropertyStore, Source};
pub use service::{ContextService, ServiceError};

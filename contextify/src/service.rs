//! Async access to sandbox contexts through a dedicated worker thread
//!
//! The QuickJS runtime is not `Send`, so a [`ContextService`] keeps its
//! [`Engine`] and every [`SandboxContext`] on one OS thread. Callers send
//! requests over a channel and await the reply. Requests are served one at a
//! time.
//!
//! # Example
//!
//! ```rust,no_run
//! use contextify::{ContextService, ContextifyConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), contextify::ServiceError> {
//! let service = ContextService::spawn(ContextifyConfig::default())?;
//!
//! let id = service.create(json!({ "x": 2 })).await?;
//! let result = service.run(id, "y = x * 21", None).await?;
//! assert_eq!(result, json!(42));
//! assert_eq!(service.sandbox(id).await?, json!({ "x": 2, "y": 42 }));
//!
//! service.destroy(id).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ContextifyConfig;
use crate::context::SandboxContext;
use crate::engine::{ContextId, Engine};
use crate::error::{CompileError, ContextifyError, ExceptionReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors returned across the service thread boundary
///
/// A `Send` projection of [`ContextifyError`]. A thrown exception is carried
/// as its [`ExceptionReport`], since the value itself cannot leave the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ServiceError {
    /// The sandbox reference was not an object
    #[error("Invalid sandbox object: {0}")]
    Construction(String),

    /// The supplied source failed to parse
    #[error(transparent)]
    Compile(CompileError),

    /// The executed script threw
    #[error("{0}")]
    Thrown(ExceptionReport),

    /// No live context has this id
    #[error("Unknown sandbox context {0}")]
    UnknownContext(ContextId),

    /// Engine failure that is not a script exception
    #[error("Engine error: {0}")]
    Engine(String),

    /// Conversion between JSON and engine values failed
    #[error("Type conversion error: {0}")]
    Conversion(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker thread is gone
    #[error("Context service worker has stopped")]
    WorkerStopped,
}

impl From<ContextifyError> for ServiceError {
    fn from(error: ContextifyError) -> Self {
        match error {
            ContextifyError::Construction { message } => Self::Construction(message),
            ContextifyError::Compile(compile) => Self::Compile(compile),
            ContextifyError::Thrown(thrown) => Self::Thrown(thrown.report),
            ContextifyError::Destroyed { id } => Self::UnknownContext(id),
            ContextifyError::Engine { message } => Self::Engine(message),
            ContextifyError::Conversion { message } => Self::Conversion(message),
            ContextifyError::Config(error) => Self::Config(error.to_string()),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Request types sent to the worker thread
enum ContextRequest {
    Create {
        sandbox: serde_json::Value,
        reply: Reply<ContextId>,
    },
    Run {
        id: ContextId,
        source: String,
        filename: Option<String>,
        reply: Reply<serde_json::Value>,
    },
    Sandbox {
        id: ContextId,
        reply: Reply<serde_json::Value>,
    },
    Destroy {
        id: ContextId,
        reply: Reply<bool>,
    },
}

/// Handle to a worker thread owning an [`Engine`] and its sandbox contexts
///
/// Dropping every clone of the handle stops the worker, which destroys any
/// contexts still alive.
#[derive(Clone)]
pub struct ContextService {
    sender: mpsc::Sender<ContextRequest>,
}

impl ContextService {
    /// Spawn the worker thread and create its engine
    ///
    /// Engine creation errors are returned here rather than on first use.
    pub fn spawn(config: ContextifyConfig) -> Result<Self, ServiceError> {
        let (tx, rx) = mpsc::channel::<ContextRequest>();
        let (init_tx, init_rx) = mpsc::channel::<Result<(), ServiceError>>();

        std::thread::Builder::new()
            .name("contextify-runtime".to_string())
            .spawn(move || match Engine::new(config) {
                Ok(engine) => {
                    let _ = init_tx.send(Ok(()));
                    Self::worker_loop(engine, rx);
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e.into()));
                }
            })
            .map_err(|e| {
                ServiceError::Engine(format!("Failed to spawn JS runtime thread: {}", e))
            })?;

        init_rx.recv().map_err(|_| ServiceError::WorkerStopped)??;
        Ok(Self { sender: tx })
    }

    /// The worker loop that owns the engine and the live contexts
    fn worker_loop(engine: Engine, rx: mpsc::Receiver<ContextRequest>) {
        let mut contexts: HashMap<ContextId, SandboxContext> = HashMap::new();

        // Process requests until all senders are dropped
        while let Ok(request) = rx.recv() {
            match request {
                ContextRequest::Create { sandbox, reply } => {
                    let result = SandboxContext::from_json(&engine, sandbox).map(|context| {
                        let id = context.id();
                        contexts.insert(id, context);
                        id
                    });
                    let _ = reply.send(result.map_err(ServiceError::from));
                }

                ContextRequest::Run {
                    id,
                    source,
                    filename,
                    reply,
                } => {
                    let result = match contexts.get_mut(&id) {
                        Some(context) => context
                            .run_json(&source, filename.as_deref())
                            .map_err(ServiceError::from),
                        None => Err(ServiceError::UnknownContext(id)),
                    };
                    let _ = reply.send(result);
                }

                ContextRequest::Sandbox { id, reply } => {
                    let result = match contexts.get(&id) {
                        Some(context) => context.sandbox_json().map_err(ServiceError::from),
                        None => Err(ServiceError::UnknownContext(id)),
                    };
                    let _ = reply.send(result);
                }

                ContextRequest::Destroy { id, reply } => {
                    let destroyed = match contexts.remove(&id) {
                        Some(mut context) => {
                            context.destroy();
                            true
                        }
                        None => false,
                    };
                    let _ = reply.send(Ok(destroyed));
                }
            }
        }

        // Contexts must go before the engine they live in
        contexts.clear();
        tracing::debug!("Context service worker shutting down");
    }

    /// Send a request to the worker and await the response
    async fn send_request<T>(
        &self,
        make_request: impl FnOnce(Reply<T>) -> ContextRequest,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make_request(tx))
            .map_err(|_| ServiceError::WorkerStopped)?;
        rx.await.map_err(|_| ServiceError::WorkerStopped)?
    }

    /// Create a sandbox context from a JSON object
    pub async fn create(&self, sandbox: serde_json::Value) -> Result<ContextId, ServiceError> {
        self.send_request(|reply| ContextRequest::Create { sandbox, reply })
            .await
    }

    /// Run `source` in context `id` and return the completion value as JSON
    pub async fn run(
        &self,
        id: ContextId,
        source: &str,
        filename: Option<&str>,
    ) -> Result<serde_json::Value, ServiceError> {
        let source = source.to_string();
        let filename = filename.map(str::to_string);
        self.send_request(|reply| ContextRequest::Run {
            id,
            source,
            filename,
            reply,
        })
        .await
    }

    /// Snapshot of the sandbox object of context `id`
    pub async fn sandbox(&self, id: ContextId) -> Result<serde_json::Value, ServiceError> {
        self.send_request(|reply| ContextRequest::Sandbox { id, reply })
            .await
    }

    /// Destroy context `id`; returns `false` if it was not alive
    pub async fn destroy(&self, id: ContextId) -> Result<bool, ServiceError> {
        self.send_request(|reply| ContextRequest::Destroy { id, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thrown_projects_to_report() {
        let report = ExceptionReport {
            name: Some("RangeError".to_string()),
            message: "too far".to_string(),
            stack: None,
            filename: "a.js".to_string(),
        };
        let error = ServiceError::Thrown(report.clone());
        assert_eq!(error.to_string(), "RangeError: too far");
    }

    #[test]
    fn test_destroyed_projects_to_unknown_context() {
        let engine = Engine::with_defaults().unwrap();
        let mut context = SandboxContext::from_json(&engine, json!({})).unwrap();
        let id = context.id();
        context.destroy();

        let error = context.run("1", None).unwrap_err();
        assert_eq!(ServiceError::from(error), ServiceError::UnknownContext(id));
    }

    #[tokio::test]
    async fn test_create_run_destroy() {
        let service = ContextService::spawn(ContextifyConfig::default()).unwrap();

        let id = service.create(json!({ "base": 40 })).await.unwrap();
        let value = service.run(id, "answer = base + 2", None).await.unwrap();
        assert_eq!(value, json!(42));
        assert_eq!(
            service.sandbox(id).await.unwrap(),
            json!({ "base": 40, "answer": 42 })
        );

        assert!(service.destroy(id).await.unwrap());
        assert!(!service.destroy(id).await.unwrap());
        assert_eq!(
            service.run(id, "1", None).await.unwrap_err(),
            ServiceError::UnknownContext(id)
        );
    }
}

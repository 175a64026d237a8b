//! Request dispatcher.
//!
//! Bridges the HTTP layer onto the execution context pool:
//!
//! - the route table is scanned once at startup from a pooled context, so
//!   unknown routes are rejected without ever touching the pool
//! - each matched request takes a context, binds itself into the context's
//!   association entry, and runs the handler on a blocking thread
//! - a handler error discards the context instead of returning it; its
//!   runtime state can no longer be trusted after an uncaught throw

use crate::runtime::{AssociationTable, ContextPool, ExecutionContext, RequestState, ScriptContext};
use pulse_common::error::{PulseError, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// What the HTTP layer needs to write a response.
pub struct DispatchOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl DispatchOutcome {
    fn plain(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Routes incoming requests to pooled execution contexts.
pub struct Dispatcher {
    pool: ContextPool<ScriptContext>,
    associations: Arc<AssociationTable>,
    routes: HashSet<String>,
    verbose_errors: bool,
}

impl Dispatcher {
    /// Build a dispatcher over an initialized pool.
    ///
    /// The route table is read from one pooled context; every context runs
    /// the same script, so any member's registry is authoritative.
    pub fn new(
        pool: ContextPool<ScriptContext>,
        associations: Arc<AssociationTable>,
        verbose_errors: bool,
    ) -> Result<Self> {
        let ctx = pool.take()?;
        let routes: HashSet<String> = ctx.routes()?.into_iter().collect();
        pool.return_context(ctx);

        for route in &routes {
            tracing::info!(route = %route, "registered route");
        }

        Ok(Self {
            pool,
            associations,
            routes,
            verbose_errors,
        })
    }

    pub fn routes(&self) -> &HashSet<String> {
        &self.routes
    }

    /// Run one request through a pooled context and collect its response.
    ///
    /// The handler itself is synchronous script execution, so it runs on a
    /// blocking thread rather than on the connection's async task.
    pub async fn dispatch(&self, request: Arc<RequestState>) -> DispatchOutcome {
        let key = request.route_key();
        if !self.routes.contains(&key) {
            return DispatchOutcome::plain(404, "no such route\n");
        }

        let ctx = match self.pool.take() {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate execution context");
                return self.internal_error(&e);
            }
        };

        self.associations.update(ctx.id(), |state| {
            state.request = Some(request.clone());
        });

        let worker = ctx.clone();
        let handler_key = key.clone();
        let result = tokio::task::spawn_blocking(move || worker.invoke(&handler_key)).await;

        match result {
            Ok(Ok(body)) => {
                let (status, headers) = {
                    let response = request.response.lock();
                    (response.status, response.headers.clone())
                };

                self.associations.update(ctx.id(), |state| {
                    state.request = None;
                });
                self.pool.return_context(ctx);

                DispatchOutcome {
                    status,
                    headers,
                    body,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(route = %key, error = %e, "handler failed");
                self.pool.discard(ctx);
                match e {
                    PulseError::UnknownRoute(_) => DispatchOutcome::plain(404, "no such route\n"),
                    other => self.internal_error(&other),
                }
            }
            Err(join_err) => {
                // The blocking task panicked; the context goes with it.
                tracing::error!(route = %key, error = %join_err, "handler task panicked");
                self.pool.discard(ctx);
                DispatchOutcome::plain(500, "internal server error\n")
            }
        }
    }

    fn internal_error(&self, err: &PulseError) -> DispatchOutcome {
        if self.verbose_errors {
            DispatchOutcome::plain(500, format!("{}\n", err))
        } else {
            DispatchOutcome::plain(500, "internal server error\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;
    use crate::runtime::bindings::Host;
    use crate::runtime::{ContextId, PoolConfig, StoreBinding};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn build_dispatcher(script: &'static str, verbose_errors: bool) -> (Dispatcher, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let memory = Arc::new(KvStore::memory().unwrap());
        let disk = Arc::new(KvStore::disk(tmp.path(), true).unwrap());
        let associations = Arc::new(AssociationTable::new());
        let generator = Arc::new(Mutex::new(ulid::Generator::new()));

        let factory_associations = associations.clone();
        let pool = ContextPool::new(
            PoolConfig {
                initial_size: 2,
                retire_after: 10_000,
            },
            associations.clone(),
            move || {
                let id = ContextId::next();
                factory_associations.update(id, |state| {
                    state.memory = Some(StoreBinding::new(memory.clone()));
                    state.disk = Some(StoreBinding::new(disk.clone()));
                });
                let host = Host::new(id, factory_associations.clone(), generator.clone());
                ScriptContext::initialize(host, script)
            },
        )
        .unwrap();

        (
            Dispatcher::new(pool, associations, verbose_errors).unwrap(),
            tmp,
        )
    }

    fn request(method: &str, path: &str, body: &str) -> Arc<RequestState> {
        RequestState::new(
            method.to_string(),
            path.to_string(),
            HashMap::new(),
            HashMap::new(),
            body.to_string(),
            "127.0.0.1".to_string(),
        )
    }

    #[tokio::test]
    async fn dispatches_to_matching_route() {
        let (dispatcher, _tmp) =
            build_dispatcher(r#"pulse.get('/hello', function(req) { return 'hi'; });"#, false);

        let outcome = dispatcher.dispatch(request("GET", "/hello", "")).await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, "hi");
    }

    #[tokio::test]
    async fn unknown_route_is_404_without_taking_a_context() {
        let (dispatcher, _tmp) =
            build_dispatcher(r#"pulse.get('/hello', function(req) { return 'hi'; });"#, false);

        let outcome = dispatcher.dispatch(request("GET", "/nope", "")).await;
        assert_eq!(outcome.status, 404);
    }

    #[tokio::test]
    async fn wrong_method_on_known_path_is_404() {
        let (dispatcher, _tmp) =
            build_dispatcher(r#"pulse.get('/hello', function(req) { return 'hi'; });"#, false);

        let outcome = dispatcher.dispatch(request("POST", "/hello", "")).await;
        assert_eq!(outcome.status, 404);
    }

    #[tokio::test]
    async fn handler_error_yields_500_and_discards_the_context() {
        let (dispatcher, _tmp) = build_dispatcher(
            r#"pulse.get('/boom', function(req) { throw new Error('boom'); });"#,
            false,
        );
        let before = dispatcher.pool.available();

        let outcome = dispatcher.dispatch(request("GET", "/boom", "")).await;
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.body, "internal server error\n");
        assert_eq!(dispatcher.pool.available(), before - 1);
    }

    #[tokio::test]
    async fn verbose_errors_surface_the_script_error() {
        let (dispatcher, _tmp) = build_dispatcher(
            r#"pulse.get('/boom', function(req) { throw new Error('kaboom'); });"#,
            true,
        );

        let outcome = dispatcher.dispatch(request("GET", "/boom", "")).await;
        assert_eq!(outcome.status, 500);
        assert!(outcome.body.contains("kaboom"));
    }

    #[tokio::test]
    async fn script_response_metadata_propagates() {
        let (dispatcher, _tmp) = build_dispatcher(
            r#"
            pulse.post('/items', function(req) {
                req.setStatus(201);
                req.setHeader('Location', '/items/1');
                return 'created';
            });
        "#,
            false,
        );

        let outcome = dispatcher.dispatch(request("POST", "/items", "{}")).await;
        assert_eq!(outcome.status, 201);
        assert_eq!(
            outcome.headers,
            vec![("Location".to_string(), "/items/1".to_string())]
        );
        assert_eq!(outcome.body, "created");
    }

    #[tokio::test]
    async fn successful_dispatch_returns_the_context() {
        let (dispatcher, _tmp) =
            build_dispatcher(r#"pulse.get('/hello', function(req) { return 'hi'; });"#, false);
        let before = dispatcher.pool.available();

        dispatcher.dispatch(request("GET", "/hello", "")).await;
        assert_eq!(dispatcher.pool.available(), before);
    }
}

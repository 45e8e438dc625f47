use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// A named unit of work dispatched by the router.
///
/// Capability modules implement this once; the name doubles as the route
/// key and as the module-switch key, so a disabled module is skipped by
/// name without the router knowing anything else about it.
pub trait Handler: Send + Sync {
    /// Stable routing name.
    fn name(&self) -> &str;

    /// Runs the unit of work. Failures stay inside the returned error;
    /// a handler must never take the caller down with it.
    fn invoke(&self, payload: Value) -> anyhow::Result<Value>;
}

/// Adapter so plain closures can be registered as handlers.
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        (self.func)(payload)
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no handler registered for route '{0}'")]
    RouteNotFound(String),
    #[error("handler for route '{route}' failed: {source}")]
    Execution {
        route: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Thread-safe name-to-handler registry.
///
/// The map lock is held only for lookups and mutations; handler execution
/// happens after the lock is released, so a slow handler never blocks
/// registration or other dispatches.
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own name. Replaces any existing
    /// handler for that name (hot swap) with a warning.
    pub fn register(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if routes.insert(name.clone(), handler).is_some() {
            warn!(route = %name, "replacing existing handler");
        }
    }

    /// Removes the named route. A missing name is a warned no-op.
    pub fn unregister(&self, name: &str) {
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if routes.remove(name).is_none() {
            warn!(route = %name, "unregister for unknown route");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    /// Names of all registered routes, sorted for stable listings.
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Looks up `name` and invokes the handler outside the registry lock.
    pub fn dispatch(&self, name: &str, payload: Value) -> Result<Value, RouterError> {
        let handler = self
            .resolve(name)
            .ok_or_else(|| RouterError::RouteNotFound(name.to_string()))?;
        handler
            .invoke(payload)
            .map_err(|source| RouterError::Execution {
                route: name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn echo() -> Arc<dyn Handler> {
        Arc::new(FnHandler::new("echo", Ok))
    }

    #[test]
    fn dispatch_returns_handler_result() {
        let router = Router::new();
        router.register(echo());

        let out = router.dispatch("echo", json!("hi")).unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[test]
    fn dispatch_unknown_route_is_route_not_found() {
        let router = Router::new();
        router.register(echo());

        let err = router.dispatch("missing", json!("hi")).unwrap_err();
        assert!(matches!(err, RouterError::RouteNotFound(name) if name == "missing"));
    }

    #[test]
    fn register_same_name_replaces_handler() {
        let router = Router::new();
        router.register(Arc::new(FnHandler::new("greet", |_| Ok(json!("old")))));
        router.register(Arc::new(FnHandler::new("greet", |_| Ok(json!("new")))));

        let out = router.dispatch("greet", Value::Null).unwrap();
        assert_eq!(out, json!("new"));
    }

    #[test]
    fn handler_failure_is_wrapped_with_route_name() {
        let router = Router::new();
        router.register(Arc::new(FnHandler::new("broken", |_| {
            Err(anyhow!("boom"))
        })));

        let err = router.dispatch("broken", Value::Null).unwrap_err();
        match err {
            RouterError::Execution { route, source } => {
                assert_eq!(route, "broken");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unregister_removes_route_and_tolerates_unknown() {
        let router = Router::new();
        router.register(echo());
        assert!(router.contains("echo"));

        router.unregister("echo");
        assert!(!router.contains("echo"));

        // A second removal must not panic or error.
        router.unregister("echo");
    }

    #[test]
    fn handlers_may_register_routes_mid_dispatch() {
        // Registration from inside a running handler only works if dispatch
        // released the registry lock before invoking.
        let router = Arc::new(Router::new());
        let inner = Arc::clone(&router);
        router.register(Arc::new(FnHandler::new("installer", move |_| {
            inner.register(Arc::new(FnHandler::new("installed", |_| {
                Ok(json!("ready"))
            })));
            Ok(json!("done"))
        })));

        assert_eq!(
            router.dispatch("installer", Value::Null).unwrap(),
            json!("done")
        );
        assert_eq!(
            router.dispatch("installed", Value::Null).unwrap(),
            json!("ready")
        );
    }

    #[test]
    fn route_names_are_sorted() {
        let router = Router::new();
        router.register(Arc::new(FnHandler::new("zeta", Ok)));
        router.register(Arc::new(FnHandler::new("alpha", Ok)));

        assert_eq!(router.route_names(), vec!["alpha", "zeta"]);
    }
}

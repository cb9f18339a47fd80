use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::protocol::{Method, RpcError};

// ---------------------------------------------------------------------------
// RpcRequest
// ---------------------------------------------------------------------------

/// A resolved RPC call as seen by a handler.
#[derive(Debug, Clone, Default)]
pub struct RpcRequest {
    /// Bindings for `:param` path segments.
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub data: Value,
    /// Authenticated caller identity, when the connection supplied one.
    pub actor: Option<String>,
}

impl RpcRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// The caller identity, or `Unauthorized` when absent. Protected
    /// endpoints call this first.
    pub fn require_actor(&self) -> Result<&str, RpcError> {
        self.actor
            .as_deref()
            .ok_or_else(|| RpcError::unauthorized("missing user context"))
    }
}

// ---------------------------------------------------------------------------
// Router internals
// ---------------------------------------------------------------------------

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
type Handler = Arc<dyn Fn(RpcRequest) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

struct Route {
    method: Method,
    segments: Vec<Segment>,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: Method, path: &[&str]) -> Option<HashMap<String, String>> {
        if self.method != method || self.segments.len() != path.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (seg, part) in self.segments.iter().zip(path.iter()) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

// ---------------------------------------------------------------------------
// RpcRouter
// ---------------------------------------------------------------------------

/// Method + path-pattern dispatch for the RPC surface.
///
/// Paths use `:name` placeholders (`/api/tickets/:id/comments/:commentId`);
/// the bound values are handed to the handler in `RpcRequest::params`.
/// Dispatch honors the caller-supplied deadline: on expiry the call fails
/// with `Timeout` and any late handler result is discarded.
pub struct RpcRouter {
    routes: RwLock<Vec<Route>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for a method + path pattern.
    pub fn register<F, Fut>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| Box::pin(handler(req)));
        let mut routes = self.routes.write().expect("router lock poisoned");
        routes.push(Route {
            method,
            segments: parse_segments(path),
            handler,
        });
    }

    /// Resolve and run the handler for a call. `NotFound` when no route
    /// matches; `Timeout` when the deadline expires first.
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        query: HashMap<String, String>,
        data: Value,
        actor: Option<String>,
        deadline: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let matched = {
            let routes = self.routes.read().expect("router lock poisoned");
            routes.iter().find_map(|route| {
                route
                    .matches(method, &parts)
                    .map(|params| (params, route.handler.clone()))
            })
        };

        let Some((params, handler)) = matched else {
            return Err(RpcError::not_found(format!("no handler for {method} {path}")));
        };

        debug!(%method, %path, "rpc dispatch");
        let req = RpcRequest {
            params,
            query,
            data,
            actor,
        };

        match deadline {
            Some(limit) => match tokio::time::timeout(limit, handler(req)).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::timeout(format!(
                    "{method} {path} exceeded {}ms",
                    limit.as_millis()
                ))),
            },
            None => handler(req).await,
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().expect("router lock poisoned").len()
    }
}

impl Default for RpcRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcErrorKind;
    use serde_json::json;

    fn no_query() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn literal_route_dispatches() {
        let router = RpcRouter::new();
        router.register(Method::Get, "/api/agents", |_req| async {
            Ok(json!(["a1"]))
        });

        let out = router
            .dispatch(Method::Get, "/api/agents", no_query(), Value::Null, None, None)
            .await
            .unwrap();
        assert_eq!(out, json!(["a1"]));
    }

    #[tokio::test]
    async fn params_are_bound() {
        let router = RpcRouter::new();
        router.register(
            Method::Post,
            "/api/tickets/:id/comments/:commentId/broadcast",
            |req| async move {
                Ok(json!({
                    "ticket": req.param("id"),
                    "comment": req.param("commentId"),
                }))
            },
        );

        let out = router
            .dispatch(
                Method::Post,
                "/api/tickets/t1/comments/c9/broadcast",
                no_query(),
                Value::Null,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(out["ticket"], "t1");
        assert_eq!(out["comment"], "c9");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let router = RpcRouter::new();
        let err = router
            .dispatch(Method::Get, "/api/nope", no_query(), Value::Null, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::NotFound);
    }

    #[tokio::test]
    async fn method_mismatch_is_not_found() {
        let router = RpcRouter::new();
        router.register(Method::Get, "/api/tickets", |_req| async { Ok(Value::Null) });
        let err = router
            .dispatch(Method::Delete, "/api/tickets", no_query(), Value::Null, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::NotFound);
    }

    #[tokio::test]
    async fn deadline_expiry_yields_timeout() {
        let router = RpcRouter::new();
        router.register(Method::Get, "/api/slow", |_req| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });

        let err = router
            .dispatch(
                Method::Get,
                "/api/slow",
                no_query(),
                Value::Null,
                None,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::Timeout);
    }

    #[tokio::test]
    async fn require_actor_guards_protected_endpoints() {
        let router = RpcRouter::new();
        router.register(Method::Post, "/api/tickets/:id/approve", |req| async move {
            req.require_actor()?;
            Ok(json!({"approved": req.param("id")}))
        });

        let err = router
            .dispatch(
                Method::Post,
                "/api/tickets/t1/approve",
                no_query(),
                Value::Null,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::Unauthorized);

        let ok = router
            .dispatch(
                Method::Post,
                "/api/tickets/t1/approve",
                no_query(),
                Value::Null,
                Some("u1".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ok["approved"], "t1");
    }

    #[tokio::test]
    async fn concurrent_dispatches_pair_responses() {
        let router = Arc::new(RpcRouter::new());
        router.register(Method::Get, "/api/echo/:n", |req| async move {
            let n = req.param("n").unwrap_or("0").to_string();
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!(n))
        });

        let mut handles = Vec::new();
        for i in 0..8 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                let out = router
                    .dispatch(
                        Method::Get,
                        &format!("/api/echo/{i}"),
                        HashMap::new(),
                        Value::Null,
                        None,
                        None,
                    )
                    .await
                    .unwrap();
                (i, out)
            }));
        }
        for h in handles {
            let (i, out) = h.await.unwrap();
            assert_eq!(out, json!(i.to_string()));
        }
    }
}

//! Method-name dispatch for inbound messages.
//!
//! A [`Router`] is a table from method name to a typed handler, filled in
//! once when a connection is built and read-only afterwards. Routing a
//! message never runs the handler inline: it hands back a [`Dispatch`]
//! future so the receive loop decides where it runs.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::pending::PendingCalls;
use crate::transport::protocol::{Message, Response, RpcError};

type RequestFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
type NotificationFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

enum Handler {
    Request(RequestFn),
    Notification(NotificationFn),
}

/// What the receive loop should do with a routed message.
pub enum Dispatch {
    /// Await the handler, then write the response to the peer.
    Reply(BoxFuture<'static, Response>),
    /// Await the handler; there is no reply channel.
    Deliver(BoxFuture<'static, ()>),
    /// Nothing left to do.
    Done,
}

/// Method-name → handler table.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler. Params are deserialized into `P` (a
    /// failure answers with invalid-params) and the result is serialized
    /// back as the response payload.
    pub fn on_request<P, R, F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let call: RequestFn = Arc::new(move |params| match parse_params::<P>(params) {
            Ok(params) => {
                let pending = handler(params);
                async move {
                    let result = pending.await?;
                    serde_json::to_value(result).map_err(RpcError::internal_error)
                }
                .boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.handlers
            .insert(method.to_string(), Handler::Request(call));
        self
    }

    /// Register a notification handler.
    pub fn on_notification<P, F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let call: NotificationFn = Arc::new(move |params| match parse_params::<P>(params) {
            Ok(params) => handler(params).boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.handlers
            .insert(method.to_string(), Handler::Notification(call));
        self
    }

    pub fn handles(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Route one inbound message.
    ///
    /// Responses are settled against `pending` right away; unmatched ids
    /// are logged. Requests always produce a reply, including for unknown
    /// methods and panicking handlers.
    pub fn route(&self, message: Message, pending: &PendingCalls) -> Dispatch {
        match message {
            Message::Request(req) => {
                let id = req.id;
                let Some(Handler::Request(call)) = self.handlers.get(&req.method) else {
                    debug!(method = %req.method, %id, "No handler for request");
                    let outcome = Err(RpcError::method_not_found(&req.method));
                    return Dispatch::Reply(future::ready(Response { id, outcome }).boxed());
                };
                let method = req.method;
                let running = AssertUnwindSafe(call(req.params)).catch_unwind();
                Dispatch::Reply(
                    async move {
                        let outcome = running.await.unwrap_or_else(|_| {
                            warn!(%method, %id, "Request handler panicked");
                            Err(RpcError::internal_error(format!("handler for {method} panicked")))
                        });
                        Response { id, outcome }
                    }
                    .boxed(),
                )
            }
            Message::Notification(note) => {
                let Some(Handler::Notification(call)) = self.handlers.get(&note.method) else {
                    debug!(method = %note.method, "No handler for notification, ignoring");
                    return Dispatch::Done;
                };
                let method = note.method;
                let running = AssertUnwindSafe(call(note.params)).catch_unwind();
                Dispatch::Deliver(
                    async move {
                        match running.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(%method, error = %e, "Notification handler failed");
                            }
                            Err(_) => warn!(%method, "Notification handler panicked"),
                        }
                    }
                    .boxed(),
                )
            }
            Message::Response(resp) => {
                let id = resp.id.clone();
                let error = resp.outcome.as_ref().err().map(ToString::to_string);
                if !pending.resolve(&resp.id, resp.outcome) {
                    warn!(%id, ?error, "Response does not match any pending request");
                }
                Dispatch::Done
            }
        }
    }
}

fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(RpcError::invalid_params)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::protocol::{Notification, Request, RequestId};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn request(id: u64, method: &str, params: Value) -> Message {
        Message::Request(Request {
            id: RequestId::Number(id),
            method: method.into(),
            params: Some(params),
        })
    }

    async fn reply(router: &Router, message: Message) -> Response {
        match router.route(message, &PendingCalls::new()) {
            Dispatch::Reply(fut) => fut.await,
            _ => panic!("expected a reply"),
        }
    }

    fn math_router() -> Router {
        let mut router = Router::new();
        router
            .on_request("math/add", |p: Add| async move { Ok(p.a + p.b) })
            .on_request("math/fail", |_: Value| async move {
                Err::<(), _>(RpcError::internal_error("nope"))
            });
        router
    }

    #[tokio::test]
    async fn typed_request_round_trip() {
        let resp = reply(&math_router(), request(1, "math/add", json!({"a": 2, "b": 3}))).await;
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.outcome, Ok(json!(5)));
    }

    #[tokio::test]
    async fn bad_params_answer_invalid_params() {
        let resp = reply(&math_router(), request(2, "math/add", json!({"a": "x"}))).await;
        assert_eq!(resp.outcome.unwrap_err().code, RpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_error_is_returned() {
        let resp = reply(&math_router(), request(3, "math/fail", json!({}))).await;
        assert_eq!(resp.outcome.unwrap_err().message, "nope");
    }

    #[tokio::test]
    async fn unknown_method_answers_method_not_found() {
        let resp = reply(&math_router(), request(4, "math/sub", json!({}))).await;
        let err = resp.outcome.unwrap_err();
        assert_eq!(err.code, RpcError::METHOD_NOT_FOUND);
        assert_eq!(err.data, Some(json!("math/sub")));
    }

    #[tokio::test]
    async fn panicking_handler_still_replies() {
        let mut router = Router::new();
        router.on_request("boom", |_: Value| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        });
        let resp = reply(&router, request(5, "boom", Value::Null)).await;
        assert_eq!(resp.outcome.unwrap_err().code, RpcError::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn notification_failures_are_swallowed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut router = Router::new();
        router.on_notification("tick", move |n: u64| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    return Err(RpcError::internal_error("zero"));
                }
                Ok(())
            }
        });

        for n in [0, 1] {
            let msg = Message::Notification(Notification {
                method: "tick".into(),
                params: Some(json!(n)),
            });
            let Dispatch::Deliver(fut) = router.route(msg, &PendingCalls::new()) else {
                panic!("expected delivery");
            };
            fut.await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let unknown = Message::Notification(Notification {
            method: "tock".into(),
            params: None,
        });
        assert!(matches!(
            router.route(unknown, &PendingCalls::new()),
            Dispatch::Done
        ));
    }

    #[tokio::test]
    async fn responses_settle_pending_calls() {
        let pending = PendingCalls::new();
        let (id, call) = pending.register().unwrap();
        let router = Router::new();

        let msg = Message::Response(Response {
            id: RequestId::Number(id),
            outcome: Ok(json!("done")),
        });
        assert!(matches!(router.route(msg, &pending), Dispatch::Done));
        assert_eq!(call.await.unwrap(), json!("done"));

        // A second response for the same id is an anomaly, not a failure.
        let dup = Message::Response(Response {
            id: RequestId::Number(id),
            outcome: Ok(json!("again")),
        });
        assert!(matches!(router.route(dup, &pending), Dispatch::Done));
    }
}

//! Handlers and the middleware chain around them.
//!
//! A [`Handler`] consumes jobs of one name from one queue. Global
//! [`Middleware`] wraps every handler call; registration order is wrapping
//! order, so the first registered middleware is the outermost and sees the
//! call first and last.
//!
//! [`FnHandler`] and [`FnMiddleware`] adapt async closures for the common
//! case where a dedicated type is not worth it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::job::Interaction;

/// Processes deliveries of one job name.
///
/// The token is the execution scope: it fires when the engine force-cancels
/// the job during a stop that overran the stopping timeout. Long-running
/// handlers should observe it at natural checkpoints; the worker also
/// abandons the call when it fires.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Job name this handler serves.
    fn name(&self) -> &str;

    /// Queue this handler consumes from.
    fn queue(&self) -> &str;

    /// Runs one job execution.
    async fn handle(&self, token: CancellationToken, job: Interaction) -> anyhow::Result<()>;
}

/// Wraps handler calls; applied globally in registration order.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        token: CancellationToken,
        job: Interaction,
        next: Arc<dyn Handler>,
    ) -> anyhow::Result<()>;
}

type HandlerFunc =
    dyn Fn(CancellationToken, Interaction) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Handler backed by an async closure.
pub struct FnHandler {
    name: String,
    queue: String,
    func: Box<HandlerFunc>,
}

impl FnHandler {
    /// Creates a handler for `name` on `queue` from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, queue: impl Into<String>, func: F) -> Self
    where
        F: Fn(CancellationToken, Interaction) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            queue: queue.into(),
            func: Box::new(move |token, job| Box::pin(func(token, job))),
        }
    }
}

#[async_trait]
impl Handler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, token: CancellationToken, job: Interaction) -> anyhow::Result<()> {
        (self.func)(token, job).await
    }
}

type MiddlewareFunc = dyn Fn(CancellationToken, Interaction, Arc<dyn Handler>) -> BoxFuture<'static, anyhow::Result<()>>
    + Send
    + Sync;

/// Middleware backed by an async closure.
pub struct FnMiddleware {
    func: Box<MiddlewareFunc>,
}

impl FnMiddleware {
    /// Creates a middleware from an async closure. The closure decides
    /// whether and when to call `next.handle(..)`.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(CancellationToken, Interaction, Arc<dyn Handler>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            func: Box::new(move |token, job, next| Box::pin(func(token, job, next))),
        }
    }
}

#[async_trait]
impl Middleware for FnMiddleware {
    async fn handle(
        &self,
        token: CancellationToken,
        job: Interaction,
        next: Arc<dyn Handler>,
    ) -> anyhow::Result<()> {
        (self.func)(token, job, next).await
    }
}

struct MiddlewareHandler {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for MiddlewareHandler {
    fn name(&self) -> &str {
        self.next.name()
    }

    fn queue(&self) -> &str {
        self.next.queue()
    }

    async fn handle(&self, token: CancellationToken, job: Interaction) -> anyhow::Result<()> {
        self.middleware
            .handle(token, job, Arc::clone(&self.next))
            .await
    }
}

/// Wraps `handler` in `middlewares` so the first element is the outermost
/// call. Folding runs in reverse registration order.
pub fn with_middlewares(
    handler: Arc<dyn Handler>,
    middlewares: &[Arc<dyn Middleware>],
) -> Arc<dyn Handler> {
    let mut wrapped = handler;
    for middleware in middlewares.iter().rev() {
        wrapped = Arc::new(MiddlewareHandler {
            middleware: Arc::clone(middleware),
            next: wrapped,
        });
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Envelope;
    use std::sync::Mutex;

    fn test_interaction() -> Interaction {
        let envelope = Envelope {
            queue: "mail".into(),
            name: "send-email".into(),
            body: "{}".into(),
            attempts: 1,
            options: Default::default(),
            result: Default::default(),
        };
        Interaction::new(&envelope)
    }

    fn tracing_middleware(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(FnMiddleware::new(move |token, job, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{label}:before"));
                let result = next.handle(token, job).await;
                log.lock().unwrap().push(format!("{label}:after"));
                result
            }
        }))
    }

    #[tokio::test]
    async fn test_fn_handler_runs_closure() {
        let handler = FnHandler::new("send-email", "mail", |_token, job| async move {
            assert_eq!(job.attempts(), 1);
            Ok(())
        });

        assert_eq!(handler.name(), "send-email");
        assert_eq!(handler.queue(), "mail");
        handler
            .handle(CancellationToken::new(), test_interaction())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = Arc::clone(&log);

        let handler: Arc<dyn Handler> =
            Arc::new(FnHandler::new("send-email", "mail", move |_token, _job| {
                let log = Arc::clone(&inner_log);
                async move {
                    log.lock().unwrap().push("handler".to_string());
                    Ok(())
                }
            }));

        let middlewares = vec![
            tracing_middleware("first", Arc::clone(&log)),
            tracing_middleware("second", Arc::clone(&log)),
        ];
        let wrapped = with_middlewares(handler, &middlewares);

        assert_eq!(wrapped.name(), "send-email");
        assert_eq!(wrapped.queue(), "mail");
        wrapped
            .handle(CancellationToken::new(), test_interaction())
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "first:before",
                "second:before",
                "handler",
                "second:after",
                "first:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let handler: Arc<dyn Handler> = Arc::new(FnHandler::new(
            "send-email",
            "mail",
            |_token, _job| async move { panic!("handler must not run") },
        ));

        let gate: Arc<dyn Middleware> = Arc::new(FnMiddleware::new(
            |_token, _job, _next| async move { Err(anyhow::anyhow!("blocked")) },
        ));

        let wrapped = with_middlewares(handler, &[gate]);
        let err = wrapped
            .handle(CancellationToken::new(), test_interaction())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "blocked");
    }

    #[tokio::test]
    async fn test_no_middlewares_is_identity() {
        let handler: Arc<dyn Handler> = Arc::new(FnHandler::new(
            "send-email",
            "mail",
            |_token, _job| async move { Ok(()) },
        ));
        let wrapped = with_middlewares(Arc::clone(&handler), &[]);
        wrapped
            .handle(CancellationToken::new(), test_interaction())
            .await
            .unwrap();
    }
}

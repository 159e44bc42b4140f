//! Request interceptor: binds a long task to every request.
//!
//! The interceptor creates a [`LongTask`] per request, installs it as the
//! current task while the handler runs, and guarantees a terminal stop once
//! the response body is done, whether it completes, errors, or is dropped
//! mid-stream. Handler unwinds are covered by the same guard.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

use crate::connection::ServedConnection;
use crate::long_task::{LongTask, StopGuard};
use crate::service::AdmissionControl;

/// Layer the interceptor over `router`.
pub fn attach(router: Router, control: Arc<AdmissionControl>) -> Router {
    router.layer(middleware::from_fn_with_state(control, intercept))
}

/// Middleware body: see the module docs.
///
/// With long tasks disabled (`maximum_long_tasks == 0`) requests pass
/// through untouched and handlers observe no current long task.
pub async fn intercept(
    State(control): State<Arc<AdmissionControl>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(pool) = control.long_task_pool() else {
        return next.run(request).await;
    };

    let connection = request.extensions().get::<Arc<ServedConnection>>().cloned();
    let task = Arc::new(LongTask::new(
        pool,
        connection,
        control.config().start_delay,
    ));

    let guard = StopGuard::new(&task);
    let response = task.with(next.run(request)).await;

    if task.is_started() {
        // The connection is going away once the body closes (promotion made
        // it non-persistent), so the terminal stop skips the re-acquire.
        response.map(|body| Body::new(CompletionBody::new(body, guard)))
    } else {
        // Nothing held; the guard's forced stop is a no-op.
        drop(guard);
        response
    }
}

/// Response body that forces a terminal stop on the request's long task
/// exactly once when the stream finishes, errors, or is dropped.
struct CompletionBody {
    inner: Body,
    guard: Option<StopGuard>,
}

impl CompletionBody {
    fn new(inner: Body, guard: StopGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }

    fn finish(&mut self) {
        // Dropping the guard fires the stop.
        self.guard = None;
    }
}

impl HttpBody for CompletionBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.finish(),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::Request as HttpRequest;
    use axum::http::StatusCode;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::AdmissionConfig;
    use crate::slot::SlotPool;

    fn control(maximum_long_tasks: usize) -> Arc<AdmissionControl> {
        Arc::new(
            AdmissionControl::new(AdmissionConfig {
                maximum_connections: 1,
                maximum_long_tasks,
                start_delay: Duration::from_millis(100),
            })
            .unwrap(),
        )
    }

    async fn served_connection() -> (Arc<SlotPool>, Arc<crate::slot::Token>, Arc<ServedConnection>) {
        let connections = Arc::new(SlotPool::new(1));
        let token = Arc::new(connections.acquire(0).await);
        let connection = Arc::new(ServedConnection::new(Some(Arc::clone(&token))));
        (connections, token, connection)
    }

    #[tokio::test]
    async fn passthrough_when_long_tasks_are_disabled() {
        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    assert!(LongTask::current().is_none());
                    "ok"
                }),
            ),
            control(0),
        );

        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handler_sees_the_current_long_task() {
        let control = control(4);
        let pool = control.long_task_pool().unwrap();
        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    assert!(LongTask::current().is_some());
                    "ok"
                }),
            ),
            Arc::clone(&control),
        );

        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Never started: the pool was never touched.
        let _ = response.into_body().collect().await;
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn terminal_stop_fires_when_the_body_completes() {
        let control = control(4);
        let pool = control.long_task_pool().unwrap();
        let (connections, token, connection) = served_connection().await;

        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    LongTask::current().unwrap().start_after(Duration::ZERO).await;
                    "ok"
                }),
            ),
            Arc::clone(&control),
        );

        let request = HttpRequest::get("/")
            .extension(Arc::clone(&connection))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        // Promotion handed the connection slot back during the handler.
        assert!(!token.is_held());
        assert_eq!(connections.available(), 1);
        assert!(!connection.is_persistent());

        // The long-task slot is held until the body is done.
        assert_eq!(pool.available(), 3);
        let _ = response.into_body().collect().await;
        assert_eq!(pool.available(), 4);

        // Terminal stop: no connection re-acquire.
        assert!(!token.is_held());
    }

    #[tokio::test]
    async fn terminal_stop_fires_when_the_body_is_dropped() {
        let control = control(4);
        let pool = control.long_task_pool().unwrap();

        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    LongTask::current().unwrap().start_after(Duration::ZERO).await;
                    "ok"
                }),
            ),
            Arc::clone(&control),
        );

        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(pool.available(), 3);

        // Mid-stream abort: the client went away without draining.
        drop(response);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn unwinding_handler_still_stops_the_task() {
        let control = control(4);
        let pool = control.long_task_pool().unwrap();

        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    LongTask::current().unwrap().start_after(Duration::ZERO).await;
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            ),
            Arc::clone(&control),
        );

        let request = HttpRequest::get("/").body(Body::empty()).unwrap();
        let outcome = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            app.oneshot(request),
        ))
        .await;

        assert!(outcome.is_err());
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn missing_connection_extension_is_tolerated() {
        let control = control(4);
        let pool = control.long_task_pool().unwrap();

        let app = attach(
            Router::new().route(
                "/",
                get(|| async {
                    // No connection token to hand off; promotion still works.
                    LongTask::current().unwrap().start_after(Duration::ZERO).await;
                    "ok"
                }),
            ),
            Arc::clone(&control),
        );

        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _ = response.into_body().collect().await;
        assert_eq!(pool.available(), 4);
    }
}

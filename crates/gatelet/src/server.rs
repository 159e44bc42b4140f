//! Serve loop wiring the accept gate into an axum application.
//!
//! HTTP framing stays hyper's problem. This glue only (i) admits
//! connections through the gate, (ii) exposes each connection's token and
//! keep-alive flag to the admission core via a request extension, and
//! (iii) honours `persistent = false` by closing the connection after the
//! response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use http::HeaderValue;
use http::header::CONNECTION;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::ServedConnection;
use crate::gate::BoundSocket;
use crate::interceptor;
use crate::service::AdmissionControl;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9292,
        }
    }
}

/// Bind and serve until SIGINT or SIGTERM.
pub async fn serve(
    config: ServerConfig,
    control: Arc<AdmissionControl>,
    app: Router,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = std::net::TcpListener::bind(addr)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    serve_with_shutdown(listener, control, app, shutdown_rx).await
}

/// Serve an already-bound listener until `shutdown` flips to true.
pub async fn serve_with_shutdown(
    listener: std::net::TcpListener,
    control: Arc<AdmissionControl>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let gate = control.gate(listener)?;
    info!("listening on {}", gate.local_addr()?);

    let app = interceptor::attach(app, Arc::clone(&control));

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                info!("server shutdown requested");
                return Ok(());
            }
            accepted = gate.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let app = app.clone();
                        tokio::spawn(serve_connection(socket, peer, app));
                    }
                    Err(err) => {
                        // Accept errors are transient; keep the loop alive.
                        warn!(error = %err, "accept failed");
                    }
                }
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        // The sender is gone without ever requesting shutdown, so no
        // request can arrive any more; keep serving.
        std::future::pending::<()>().await;
    }
}

async fn serve_connection(socket: BoundSocket, peer: SocketAddr, app: Router) {
    let connection = Arc::new(ServedConnection::new(Some(Arc::clone(socket.token()))));

    let service = service_fn({
        let connection = Arc::clone(&connection);
        move |mut request: http::Request<Incoming>| {
            let app = app.clone();
            let connection = Arc::clone(&connection);
            async move {
                request.extensions_mut().insert(Arc::clone(&connection));
                let mut response =
                    match tower::ServiceExt::oneshot(app, request.map(Body::new)).await {
                        Ok(response) => response,
                        Err(infallible) => match infallible {},
                    };
                // A promoted request gave this connection's slot back; a
                // further request on it would run with no slot at all.
                if !connection.is_persistent() {
                    response
                        .headers_mut()
                        .insert(CONNECTION, HeaderValue::from_static("close"));
                }
                Ok::<_, Infallible>(response)
            }
        }
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(socket), service)
        .await
    {
        debug!(%peer, error = %err, "connection ended with error");
    }
}

/// Resolve once the process is asked to stop (SIGINT or SIGTERM).
///
/// A signal whose handler cannot be installed simply never triggers; the
/// other one still works, and the watch channel remains available as a
/// programmatic stop.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "SIGINT handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("interrupt signal, stopping accept loop"),
        _ = terminate => info!("termination signal, stopping accept loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::config::AdmissionConfig;
    use crate::long_task::LongTask;

    fn control() -> Arc<AdmissionControl> {
        Arc::new(
            AdmissionControl::new(AdmissionConfig {
                maximum_connections: 2,
                maximum_long_tasks: 4,
                start_delay: Duration::from_millis(100),
            })
            .unwrap(),
        )
    }

    async fn until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn promoted_request_closes_the_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let control = control();

        let app = Router::new().route(
            "/",
            get(|| async {
                LongTask::current().unwrap().start_after(Duration::ZERO).await;
                "done waiting"
            }),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_with_shutdown(
            listener,
            Arc::clone(&control),
            app,
            shutdown_rx,
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        // The server closing the connection is what lets read_to_end finish.
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw).to_lowercase();
        assert!(text.starts_with("http/1.1 200"));
        assert!(text.contains("connection: close"));
        assert!(text.contains("done waiting"));

        // Every slot comes back once the connection is gone.
        until(|| {
            let stats = control.statistics();
            stats.connection_pool.available == 2 && stats.long_task_pool.available == 4
        })
        .await;

        let _ = shutdown_tx.send(true);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn plain_request_keeps_the_connection_open() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let control = control();

        let app = Router::new().route("/", get(|| async { "ok" }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_with_shutdown(
            listener,
            Arc::clone(&control),
            app,
            shutdown_rx,
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..2 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed a persistent connection");
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_lowercase();
                if text.contains("ok") {
                    assert!(text.starts_with("http/1.1 200"));
                    assert!(!text.contains("connection: close"));
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        server.await.unwrap().unwrap();
    }
}

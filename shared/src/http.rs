use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds `host:port` and serves `app` until ctrl-c or SIGTERM.
pub async fn run_http_service(host: &str, port: u16, app: Router) -> Result<(), ServeError> {
    run_http_service_until(host, port, app, shutdown_signal()).await
}

/// Same as [`run_http_service`] but stops when `shutdown` resolves.
pub async fn run_http_service_until<F>(
    host: &str,
    port: u16,
    app: Router,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!(%addr, "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        // Reserve a free port, then release it for the server.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let app = Router::new().route("/healthz", get(|| async { "ok" }));
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(run_http_service_until("127.0.0.1", port, app, async {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let body = reqwest::get(format!("http://127.0.0.1:{port}/healthz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = run_http_service_until("127.0.0.1", port, Router::new(), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Bind { .. }));
    }
}

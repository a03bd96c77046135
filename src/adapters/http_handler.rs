use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router as AxumRouter,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::{
    adapters::file_system::FileSystemAdapter,
    core::multiplexer::Multiplexer,
    ports::file_system::FileSystem,
    tracing_setup::create_request_span,
    utils::graceful_shutdown::GracefulShutdown,
};

/// Bridges axum to the multiplexer: every path and method is forwarded unchanged
pub struct HttpHandler<F: FileSystem = FileSystemAdapter> {
    multiplexer: Arc<Multiplexer<F>>,
}

impl<F: FileSystem> Clone for HttpHandler<F> {
    fn clone(&self) -> Self {
        Self {
            multiplexer: self.multiplexer.clone(),
        }
    }
}

impl<F: FileSystem> HttpHandler<F> {
    pub fn new(multiplexer: Arc<Multiplexer<F>>) -> Self {
        Self { multiplexer }
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer<F>> {
        &self.multiplexer
    }

    /// Answer one request inside a request span
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
        let response = self
            .multiplexer
            .serve_http(req, client_addr)
            .instrument(span.clone())
            .await;
        span.record("http.status_code", response.status().as_u16());
        response
    }

    /// axum router sending `/` and every other path to the multiplexer
    pub fn into_router(self) -> AxumRouter {
        let root = self.clone();
        AxumRouter::new()
            .route("/", request_route(root))
            .route("/{*path}", request_route(self))
    }
}

fn request_route<F: FileSystem>(handler: HttpHandler<F>) -> axum::routing::MethodRouter {
    any(move |req: Request| {
        let handler = handler.clone();
        async move {
            let client_addr = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            Ok::<_, Infallible>(handler.handle_request(req, client_addr).await)
        }
    })
}

/// Serve on `listener` until `shutdown` fires, then drain for at most its timeout
pub async fn serve<F: FileSystem>(
    listener: TcpListener,
    handler: HttpHandler<F>,
    shutdown: GracefulShutdown,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .wrap_err("Failed to read listener address")?;
    tracing::info!("Trellis listening on {}", addr);

    let app = handler.into_router();
    let signal = {
        let shutdown = shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received: {:?}, draining requests", reason);
        }
    };
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal);

    let drain_deadline = async {
        shutdown.wait_for_shutdown_signal().await;
        tokio::time::sleep(shutdown.drain_timeout()).await;
    };

    tokio::select! {
        result = server => {
            result.wrap_err("Server error")?;
            tracing::info!("Graceful shutdown completed");
        }
        _ = drain_deadline => {
            tracing::warn!(
                "Requests still in flight after {:?}, forcing shutdown",
                shutdown.drain_timeout()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::models::AppConfig,
        core::{
            context::RequestContext,
            controller::{ActionResult, Controller},
            router::Router,
        },
    };

    #[derive(Clone, Default)]
    struct Root;

    #[async_trait::async_trait]
    impl Controller for Root {
        async fn get(&mut self, ctx: &mut RequestContext) -> ActionResult {
            ctx.text(StatusCode::OK, "root");
            Ok(())
        }
    }

    fn handler() -> HttpHandler {
        let mut router = Router::new();
        router.handle("/", Root).unwrap();
        router.handle("/deep/path", Root).unwrap();
        let mux = Multiplexer::builder(AppConfig::builder().static_dirs(vec![]).build())
            .router(router)
            .build();
        HttpHandler::new(Arc::new(mux))
    }

    #[tokio::test]
    async fn test_router_forwards_every_path() {
        let app = handler().into_router();
        for path in ["/", "/deep/path"] {
            let response = app
                .clone()
                .oneshot(hyper::Request::get(path).body(AxumBody::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"root");
        }

        let response = app
            .oneshot(hyper::Request::get("/missing").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = GracefulShutdown::with_timeout(std::time::Duration::from_secs(1));
        let server = tokio::spawn(serve(listener, handler(), shutdown.clone()));

        tokio::task::yield_now().await;
        shutdown.trigger_shutdown(crate::utils::ShutdownReason::Requested);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

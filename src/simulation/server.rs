use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use tokio_util::sync::CancellationToken;

use super::policy::{Page, QueryParams, RoutingPolicy};
use super::sandbox::AssetRoot;
use super::StatusSlot;
use crate::errors::{UnsubError, UnsubResult};

/// How long in-flight connections get once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const FALLBACK_404: &str = "<!DOCTYPE html><html><body><h1>404 Not Found</h1></body></html>";

/// Everything a request handler can touch.
pub(crate) struct SiteState {
    pub policy: Arc<dyn RoutingPolicy>,
    pub assets: AssetRoot,
    pub status: StatusSlot,
}

/// Loopback HTTP server on its own thread and runtime.
pub(crate) struct SimServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn spawn(site: SiteState) -> UnsubResult<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .fallback(handle)
            .layer(axum::middleware::map_response(close_connection))
            .with_state(Arc::new(site));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let thread = std::thread::Builder::new()
            .name(format!("sim-server-{}", addr.port()))
            .spawn(move || serve(listener, app, token))
            .map_err(|e| UnsubError::Simulation(format!("could not spawn server thread: {e}")))?;

        tracing::debug!(%addr, "simulation server listening");
        Ok(Self {
            addr,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stops accepting, gives open connections a short grace period and joins
    /// the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(addr = %self.addr, "simulation server thread panicked");
            }
            tracing::debug!(addr = %self.addr, "simulation server stopped");
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(listener: std::net::TcpListener, app: Router, token: CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "simulation runtime failed to start");
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "simulation listener unusable");
                return;
            }
        };
        let graceful = token.clone();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .into_future();

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "simulation server exited with error");
                }
            }
            _ = async {
                token.cancelled().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::debug!("simulation server forced down after grace period");
            }
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

async fn handle(State(site): State<Arc<SiteState>>, uri: Uri) -> Response {
    let query = QueryParams::parse(uri.query().unwrap_or(""));
    // routing and sandboxing both see the decoded path
    let Ok(path) = percent_decode_str(uri.path()).decode_utf8() else {
        tracing::trace!(path = uri.path(), "undecodable path");
        return not_found(&site.assets).await;
    };
    let route = site.policy.route(&path, &query);
    tracing::trace!(path = %path, ?route, "simulation request");

    if let Some(status) = route.status {
        site.status.set(status);
    }

    match route.page {
        Page::Asset(rel) => match site.assets.resolve(&rel) {
            Ok(path) => file_response(StatusCode::OK, &path).await,
            Err(e) => {
                tracing::trace!(error = %e, "serving 404");
                not_found(&site.assets).await
            }
        },
        Page::NotFound => not_found(&site.assets).await,
    }
}

async fn file_response(status: StatusCode, path: &std::path::Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(body) => (status, [(header::CONTENT_TYPE, content_type(path))], body).into_response(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "asset unreadable");
            (StatusCode::INTERNAL_SERVER_ERROR, "asset unreadable").into_response()
        }
    }
}

async fn not_found(assets: &AssetRoot) -> Response {
    match assets.not_found_page() {
        Some(page) => file_response(StatusCode::NOT_FOUND, &page).await,
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            FALLBACK_404,
        )
            .into_response(),
    }
}

async fn close_connection(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

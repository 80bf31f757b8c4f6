//! OAuth callback server
//!
//! A minimal HTTP server to receive the OAuth authorization code after
//! user authorization in the browser. One route, one request: the handler
//! pushes the outcome through a `oneshot` channel and the server is
//! aborted as soon as the caller has its code.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// OAuth callback result
#[derive(Debug)]
pub struct CallbackResult {
    /// Authorization code
    pub code: String,
}

/// State shared with the callback handler
struct CallbackState {
    expected_state: String,
    tx: Option<oneshot::Sender<Result<CallbackResult>>>,
}

/// A running callback server
pub struct CallbackServer {
    /// Redirect URI to hand to the authorization endpoint
    pub redirect_uri: String,
    /// Receiver for the callback result
    receiver: oneshot::Receiver<Result<CallbackResult>>,
    /// Server task handle
    server_handle: tokio::task::JoinHandle<Result<()>>,
}

impl CallbackServer {
    /// Wait for the browser redirect to deliver the authorization code.
    pub async fn wait(self) -> Result<CallbackResult> {
        let result = self
            .receiver
            .await
            .map_err(|_| Error::Internal("callback channel closed unexpectedly".into()))?;

        // One redirect is all this server exists for.
        self.server_handle.abort();
        result
    }
}

/// Start a callback server and return it immediately, so the caller can
/// put the redirect URI into the authorization URL before waiting.
///
/// Ports named in `redirect_uris` are tried in order (a provider that
/// pins registered redirect URIs needs the exact port); otherwise an
/// ephemeral port is used.
pub async fn start(expected_state: String, redirect_uris: &[String]) -> Result<CallbackServer> {
    let (listener, redirect_uri, path) = bind(redirect_uris).await?;
    info!(url = %redirect_uri, "OAuth callback server listening");

    let (tx, rx) = oneshot::channel();
    let state = Arc::new(tokio::sync::Mutex::new(CallbackState {
        expected_state,
        tx: Some(tx),
    }));

    let app = Router::new()
        .route(&path, get(handle_callback))
        .with_state(state);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("callback server error: {e}")))
    });

    Ok(CallbackServer {
        redirect_uri,
        receiver: rx,
        server_handle: server,
    })
}

/// Bind the loopback listener: configured redirect ports first, then an
/// ephemeral port. Returns the listener, the redirect URI, and the route
/// path the redirect URI names.
async fn bind(redirect_uris: &[String]) -> Result<(TcpListener, String, String)> {
    for uri in redirect_uris {
        let Ok(parsed) = url::Url::parse(uri) else {
            warn!(uri = %uri, "Skipping unparsable redirect URI");
            continue;
        };
        let Some(port) = parsed.port() else { continue };
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let path = match parsed.path() {
                    "" => "/".to_string(),
                    p => p.to_string(),
                };
                return Ok((listener, uri.clone(), path));
            }
            Err(e) => debug!(port, error = %e, "Redirect port unavailable"),
        }
    }

    let addr: SocketAddr = "127.0.0.1:0"
        .parse()
        .map_err(|e| Error::Internal(format!("bad loopback address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    Ok((
        listener,
        format!("http://localhost:{port}/callback"),
        "/callback".to_string(),
    ))
}

/// Handle the OAuth callback
async fn handle_callback(
    State(state): State<Arc<tokio::sync::Mutex<CallbackState>>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(?params, "Received OAuth callback");

    let mut state = state.lock().await;

    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        deliver(
            &mut state,
            Err(Error::ProviderNet(format!(
                "authorization failed: {error} {description}"
            ))),
        );
        return Html(format!(
            "<html><body><h1>Login failed</h1><p>{error}: {description}</p></body></html>"
        ));
    }

    if params.state.as_deref() != Some(&state.expected_state) {
        deliver(
            &mut state,
            Err(Error::Internal(
                "callback state mismatch; possible CSRF".into(),
            )),
        );
        return Html(
            "<html><body><h1>Login failed</h1><p>State mismatch.</p></body></html>".to_string(),
        );
    }

    let Some(code) = params.code else {
        deliver(
            &mut state,
            Err(Error::ProviderNet("redirect carried no authorization code".into())),
        );
        return Html(
            "<html><body><h1>Login failed</h1><p>No code received.</p></body></html>".to_string(),
        );
    };

    deliver(&mut state, Ok(CallbackResult { code }));
    Html(
        "<html><body><h1>Login complete</h1><p>You can close this tab and return to the terminal.</p></body></html>"
            .to_string(),
    )
}

/// Push a result through the channel; late or duplicate redirects are
/// dropped on the floor.
fn deliver(state: &mut CallbackState, result: Result<CallbackResult>) {
    if let Some(tx) = state.tx.take() {
        let _ = tx.send(result);
    }
}

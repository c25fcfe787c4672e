use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use axum::extract::{MatchedPath, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use quotewall_api::{QuickiePage, QuickieRequest, QuoteWallApi, API_CONTRACT_VERSION};
use quotewall_core::{CookieCodec, CookieKey, COOKIE_LIFETIME, COOKIE_NAME};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: QuoteWallApi,
    secure_cookie: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone)]
struct ServiceError {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Template)]
#[template(path = "quickie.html")]
struct QuickieTemplate<'a> {
    page: &'a QuickiePage,
}

#[derive(Debug, Parser)]
#[command(name = "quotewall-service")]
#[command(about = "Quote wall HTTP service")]
struct Args {
    #[arg(long, env = "QUOTEWALL_DB", default_value = "./quotewall.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "QUOTEWALL_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// File holding the 64-hex-character cookie key. A random key is used when omitted.
    #[arg(long, env = "QUOTEWALL_COOKIE_KEY_FILE")]
    cookie_key_file: Option<PathBuf>,
    /// Mark the `NextQuote` cookie `Secure`.
    #[arg(long, env = "QUOTEWALL_SECURE_COOKIE")]
    secure_cookie: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, [(CACHE_CONTROL, "no-store")], self.error).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { error: message.into() }
    }

    fn set_cookie(&self, value: &str) -> String {
        let mut cookie = format!(
            "{COOKIE_NAME}={value}; Max-Age={}; Path=/; HttpOnly; SameSite=Strict",
            COOKIE_LIFETIME.whole_seconds()
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/quickie", get(quickie))
        .route("/conversations/quickie", get(quickie))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let key = load_cookie_key(args.cookie_key_file.as_deref())?;
    let api = QuoteWallApi::new(args.db, CookieCodec::new(key));
    let migrated = api.migrate(false)?;
    info!(schema_version = ?migrated.after_version, "database ready");

    let state = ServiceState { api, secure_cookie: args.secure_cookie };
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "quote wall listening");

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("quote wall stopped");
    Ok(())
}

fn load_cookie_key(path: Option<&Path>) -> Result<CookieKey> {
    let Some(path) = path else {
        warn!("no cookie key file configured; cursors will not survive a restart");
        return Ok(CookieKey::generate());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read cookie key file {}", path.display()))?;
    CookieKey::from_hex(&raw)
        .with_context(|| format!("invalid cookie key in {}", path.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn quickie(
    State(state): State<ServiceState>,
    matched: MatchedPath,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let request = QuickieRequest {
        route: matched.as_str().to_string(),
        params,
        cookie: cursor_cookie(&headers),
    };

    let api = state.api.clone();
    let response = tokio::task::spawn_blocking(move || api.quickie(&request))
        .await
        .map_err(|err| ServiceState::error(format!("request task failed: {err}")))?
        .map_err(|err| {
            warn!(route = matched.as_str(), error = %format!("{err:#}"), "quickie request failed");
            ServiceState::error(format!("{err:#}"))
        })?;

    let html = QuickieTemplate { page: &response.page }
        .render()
        .map_err(|err| ServiceState::error(format!("failed to render page: {err}")))?;
    let set_cookie = HeaderValue::from_str(&state.set_cookie(&response.cookie))
        .map_err(|err| ServiceState::error(format!("invalid cookie header: {err}")))?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8")),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (SET_COOKIE, set_cookie),
        ],
        html,
    )
        .into_response())
}

/// First `NextQuote` value across all `Cookie` headers.
fn cursor_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

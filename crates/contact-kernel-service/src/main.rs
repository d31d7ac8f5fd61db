use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_kernel_api::{ContactKernelApi, IdentifyError, IdentifyRequest};
use contact_kernel_core::ContactResponse;
use regex::Regex;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const EMAIL_PATTERN: &str = r"^[\w-]+(\.[\w-]+)*@([\w-]+\.)+[A-Za-z]{2,7}$";
const PHONE_PATTERN: &str = r"^\+?[1-9]\d{1,14}$";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ContactKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Parser)]
#[command(name = "contact-kernel-service")]
#[command(about = "Local HTTP service for Contact Kernel")]
struct Args {
    #[arg(long, default_value = "./contact_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal Server Error".to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn email_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| match Regex::new(EMAIL_PATTERN) {
        Ok(regex) => regex,
        Err(err) => panic!("email pattern failed to compile: {err}"),
    })
}

fn phone_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| match Regex::new(PHONE_PATTERN) {
        Ok(regex) => regex,
        Err(err) => panic!("phone pattern failed to compile: {err}"),
    })
}

// Shape checks belong to the HTTP edge; the core only requires presence.
fn validate_request(request: &IdentifyRequest) -> Result<(), ServiceError> {
    if request.email.is_none() && request.phone_number.is_none() {
        return Err(ServiceError::bad_request(
            "at least one of email or phoneNumber must be provided",
        ));
    }

    if let Some(email) = request.email.as_deref() {
        if !email_regex().is_match(email) {
            return Err(ServiceError::bad_request("invalid email format"));
        }
    }
    if let Some(phone) = request.phone_number.as_deref() {
        if !phone_regex().is_match(phone) {
            return Err(ServiceError::bad_request("invalid phoneNumber format"));
        }
    }

    Ok(())
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/identify", post(identify))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let state = ServiceState { api: ContactKernelApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "contact-kernel-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn identify(
    State(state): State<ServiceState>,
    Json(request): Json<IdentifyRequest>,
) -> Result<Json<ContactResponse>, ServiceError> {
    validate_request(&request)?;

    match state.api.identify(&request) {
        Ok(response) => Ok(Json(response)),
        Err(IdentifyError::Precondition(message)) => Err(ServiceError::bad_request(message)),
        Err(IdentifyError::Infrastructure(err)) => {
            tracing::error!(error = %err, "identify request failed");
            Err(ServiceError::internal())
        }
    }
}

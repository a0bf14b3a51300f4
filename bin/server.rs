// Slip Renewal - Web Server
// Submission form + REST API with Axum

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Local, NaiveTime};
use clap::Parser;
use serde::{Deserialize, Serialize};
use slip_renewal::{
    build_extractor, decode, entitlement_history, parse_time_of_day, AppConfig, EntitlementChange,
    Extension, LogEntry, LogStore, MemberRecord, MemberStore, MonthToken, SqliteStore,
    SubmissionError, SubmissionForm, SubmissionOutcome, SubmissionService,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Slips are phone screenshots; leave room above axum's 2 MB default
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Entitlement changes returned with a member
const MEMBER_HISTORY_LIMIT: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "slip-renewal-server", version, about = "Slip renewal web server")]
struct Cli {
    #[arg(short, long, default_value = slip_renewal::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Overrides [server] bind from the config file
    #[arg(long)]
    bind: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<SqliteStore>>,
    service: Arc<SubmissionService>,
    config: Arc<AppConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    error!(error = %e, "{}", context);
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiResponse::<()>::err("System error, please try again later"),
    )
}

#[derive(Serialize)]
struct InfoResponse {
    version: &'static str,
    payment_instructions: String,
    unit_price: i64,
    slip_policy: &'static str,
    current_month: String,
}

/// Member response with the decoded view alongside the stored string
#[derive(Serialize)]
struct MemberResponse {
    member_id: String,
    name: String,
    aliases: Vec<String>,
    entitlement: String,
    months_covered: usize,
    paid_through: Option<String>,
    active: bool,
    history: Vec<EntitlementChange>,
}

impl MemberResponse {
    fn new(member: MemberRecord, current: MonthToken, history: Vec<EntitlementChange>) -> Self {
        let covered = decode(&member.entitlement);
        Self {
            history,
            aliases: member.alias_list().into_iter().map(str::to_string).collect(),
            months_covered: covered.len(),
            paid_through: covered.latest().map(|t| t.to_string()),
            active: covered.contains(&current),
            member_id: member.member_id,
            name: member.name,
            entitlement: member.entitlement,
        }
    }
}

#[derive(Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PreviewRequest {
    entitlement: String,
    amount: i64,
    /// YEAR-MM in the stored year numbering; defaults to the current month
    now: Option<String>,
}

/// Run `f` against the store on the blocking pool.
///
/// SQLite calls and the store mutex never block an async worker.
async fn with_store<T, F>(state: &AppState, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&SqliteStore) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || {
        let store = store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
        f(&store)
    })
    .await
    .context("store task failed")?
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/info - What the form page needs to show
async fn get_info(State(state): State<AppState>) -> impl IntoResponse {
    let info = InfoResponse {
        version: slip_renewal::VERSION,
        payment_instructions: state.config.payment_instructions.clone(),
        unit_price: state.config.unit_price,
        slip_policy: state.config.slip_policy.as_str(),
        current_month: state.service.current_month(Local::now()).to_string(),
    };
    Json(ApiResponse::ok(info))
}

/// GET /api/members/:key - Look up a member by id, name or alias
async fn get_member(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    // Decode URL-encoded names (Thai names arrive percent-encoded)
    let key = urlencoding::decode(&key)
        .map(|k| k.into_owned())
        .unwrap_or(key);

    let lookup_key = key.clone();
    let found = with_store(&state, move |store| {
        let Some(member) = store.lookup(&lookup_key)? else {
            return Ok(None);
        };
        let history = entitlement_history(store.connection(), &member.member_id, MEMBER_HISTORY_LIMIT)?;
        Ok(Some((member, history)))
    })
    .await;

    match found {
        Ok(Some((member, history))) => {
            let current = state.service.current_month(Local::now());
            reply(
                StatusCode::OK,
                ApiResponse::ok(MemberResponse::new(member, current, history)),
            )
        }
        Ok(None) => reply(
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err(format!("No member named '{}'", key)),
        ),
        Err(e) => internal_error("member lookup failed", format!("{:#}", e)),
    }
}

/// GET /api/logs?limit=N - Most recent transaction log rows, newest first
async fn get_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).min(1000);

    match with_store(&state, move |store| store.recent_log(limit)).await {
        Ok(mut entries) => {
            entries.reverse();
            reply(StatusCode::OK, ApiResponse::<Vec<LogEntry>>::ok(entries))
        }
        Err(e) => internal_error("reading transaction log failed", format!("{:#}", e)),
    }
}

/// POST /api/entitlements/preview - Show what an amount would buy
///
/// Bounded by `max_months_per_submission`, so it runs inline.
async fn preview_extension(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> Response {
    let now = match req.now.as_deref() {
        Some(s) => match s.parse::<MonthToken>() {
            Ok(token) => token,
            Err(e) => return reply(StatusCode::BAD_REQUEST, ApiResponse::<()>::err(e)),
        },
        None => state.service.current_month(Local::now()),
    };

    match state.service.extender().extend_detailed(&req.entitlement, req.amount, now) {
        Ok(ext) => reply(StatusCode::OK, ApiResponse::<Extension>::ok(ext)),
        Err(e) => reply(StatusCode::BAD_REQUEST, ApiResponse::<()>::err(e.to_string())),
    }
}

/// POST /api/submissions - Multipart form: slip, sender_name, amount, transfer_time
async fn create_submission(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut form = SubmissionForm::default();
    let mut amount_text = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return reply(StatusCode::BAD_REQUEST, ApiResponse::<()>::err(e.to_string())),
        };

        let name = field.name().unwrap_or_default().to_string();
        let result = match name.as_str() {
            "slip" => field.bytes().await.map(|b| form.slip_image = b.to_vec()),
            "sender_name" => field.text().await.map(|t| form.sender_name = t),
            "amount" => field.text().await.map(|t| amount_text = t),
            "transfer_time" => field.text().await.map(|t| form.manual_time = parse_manual_time(&t)),
            _ => Ok(()),
        };

        if let Err(e) = result {
            return reply(StatusCode::BAD_REQUEST, ApiResponse::<()>::err(e.to_string()));
        }
    }

    form.amount = match amount_text.trim().parse::<i64>() {
        Ok(amount) => amount,
        Err(_) => {
            return reply(
                StatusCode::BAD_REQUEST,
                ApiResponse::<()>::err(format!("Amount must be a whole number, got '{}'", amount_text)),
            )
        }
    };

    // OCR and SQLite are blocking. The slip is read before the store is locked.
    let task_state = state.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let prepared = task_state.service.prepare(&form)?;
        let store = task_state
            .store
            .lock()
            .map_err(|e| SubmissionError::Store(anyhow::anyhow!("store lock poisoned: {}", e)))?;
        task_state.service.commit(&*store, &prepared, Local::now())
    })
    .await;

    match joined {
        Ok(Ok(outcome)) => submission_response(outcome),
        Ok(Err(e)) => submission_error_response(e),
        Err(e) => internal_error("submission task failed", e),
    }
}

fn parse_manual_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        parse_time_of_day(text)
    }
}

#[derive(Serialize)]
struct SubmissionResponse {
    message: String,
    #[serde(flatten)]
    outcome: SubmissionOutcome,
}

fn submission_response(outcome: SubmissionOutcome) -> Response {
    let status = match outcome {
        SubmissionOutcome::Extended { .. } => StatusCode::OK,
        // Logged for an admin, but nothing was extended
        SubmissionOutcome::MemberNotFound { .. } => StatusCode::ACCEPTED,
    };
    let body = SubmissionResponse {
        message: outcome.message(),
        outcome,
    };
    reply(status, ApiResponse::ok(body))
}

fn submission_error_response(e: SubmissionError) -> Response {
    match e {
        SubmissionError::Duplicate { .. } => {
            reply(StatusCode::CONFLICT, ApiResponse::<()>::err(e.to_string()))
        }
        SubmissionError::Store(inner) => internal_error("submission failed", format!("{:#}", inner)),
        other => reply(StatusCode::BAD_REQUEST, ApiResponse::<()>::err(other.to_string())),
    }
}

/// GET / - Serve the submission form
async fn serve_index() -> impl IntoResponse {
    Html(include_str!("../web/index.html"))
}

// ============================================================================
// Main Server
// ============================================================================

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/info", get(get_info))
        .route("/submissions", post(create_submission))
        .route("/members/:key", get(get_member))
        .route("/logs", get(get_logs))
        .route("/entitlements/preview", post(preview_extension))
        .with_state(state);

    Router::new()
        .route("/", get(serve_index))
        .nest("/api", api_routes)
        .nest_service("/static", ServeDir::new("web"))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(CorsLayer::permissive()),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    println!("🌐 Slip Renewal - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;

    let store = SqliteStore::open(&config.database_path)?;
    println!("✓ Database opened: {:?}", config.database_path);

    // One OCR engine for the whole process
    let extractor = build_extractor(&config);
    let service = SubmissionService::from_config(extractor, &config)?;
    println!("✓ Slip policy: {}", config.slip_policy.as_str());

    let addr = cli.bind.clone().unwrap_or_else(|| config.server.bind.clone());

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        service: Arc::new(service),
        config: Arc::new(config),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "server listening");
    println!("\n🚀 Server running on http://{}", addr);
    println!("   Form: http://{}/", addr);
    println!("   API:  http://{}/api/logs", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_blank_is_none() {
        assert_eq!(parse_manual_time("   "), None);
        assert_eq!(parse_manual_time("14:05"), NaiveTime::from_hms_opt(14, 5, 0));
    }

    #[test]
    fn test_member_response_active() {
        let member = MemberRecord::new("M1", "Somchai", "Chai, Som", "2568:5-7:*");
        let resp = MemberResponse::new(member, MonthToken::new(2568, 6).unwrap(), Vec::new());
        assert!(resp.active);
        assert_eq!(resp.months_covered, 3);
        assert_eq!(resp.paid_through.as_deref(), Some("2568-07"));
        assert_eq!(resp.aliases, vec!["Chai", "Som"]);
    }

    #[test]
    fn test_duplicate_maps_to_conflict() {
        let e = SubmissionError::Duplicate {
            previous_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            minutes_apart: 5,
        };
        assert_eq!(submission_error_response(e).status(), StatusCode::CONFLICT);
        assert_eq!(
            submission_error_response(SubmissionError::MissingSlip).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_oversized_amount_is_bad_request() {
        let e: SubmissionError = slip_renewal::ExtendError::TooManyMonths { months: 5000, max: 120 }.into();
        assert_eq!(submission_error_response(e).status(), StatusCode::BAD_REQUEST);
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
};
use escrow_core::{
    AccountId, CacheStore, DealId, DealProposal, EscrowError, LedgerClient, LogAppender,
    LogReader, Reputation, Role, VotingStatus,
};
use escrow_engine::{
    DEFAULT_QUEUE_CAPACITY, DealEngine, DealListing, Dispatcher, LogPublisher, Mailer,
    ReconciledDeal, Reconciler, TransitionOutcome,
};
use escrow_ledger::{InMemoryLedger, JsonRpcLedger, JsonRpcTopicWriter};
use escrow_platform::{
    AcceptDealRequest, FundDealRequest, HealthResponse, LogMailer, PgCacheStore,
    PgContactDirectory, RedisBus, RedisMailer, RegisterContactRequest, ReputationQuery,
    ServiceConfig, SubmitEvidenceRequest, VoteRequest, connect_database, ensure_schema,
};
use escrow_store::{InMemoryCache, InMemoryLog, MirrorLogReader};
use tracing::{info, warn};

const ACCOUNT_HEADER: &str = "x-account-id";

#[derive(Clone)]
struct AppState {
    engine: DealEngine,
    contacts: Option<PgContactDirectory>,
    health: HealthResponse,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "escrow_gateway=info,escrow_engine=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let state = build_state(&config).await?;

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/deals", get(list_deals).post(create_deal))
        .route("/deals/{deal_id}", get(get_deal))
        .route("/deals/{deal_id}/accept", post(accept_deal))
        .route("/deals/{deal_id}/fund", post(fund_deal))
        .route("/deals/{deal_id}/release", post(release_funds))
        .route("/deals/{deal_id}/dispute", post(raise_dispute))
        .route("/deals/{deal_id}/evidence", post(submit_evidence))
        .route("/deals/{deal_id}/votes", post(vote_on_dispute))
        .route("/deals/{deal_id}/refund", post(refund_buyer))
        .route("/deals/{deal_id}/voting-status", get(voting_status))
        .route("/reputation/{account_id}", get(reputation))
        .route("/contacts/me", put(register_contact))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn build_state(config: &ServiceConfig) -> AnyResult<AppState> {
    let mut topic_writer: Option<Arc<dyn LogAppender>> = None;
    let ledger: Arc<dyn LedgerClient> = match &config.ledger_rpc_url {
        Some(url) => {
            let rpc = Arc::new(JsonRpcLedger::new(url, config.ledger_timeout)?);
            if let Some(mirror) = &config.mirror {
                topic_writer = Some(Arc::new(JsonRpcTopicWriter::new(
                    rpc.clone(),
                    &mirror.topic_id,
                )));
            }
            rpc
        }
        None => {
            warn!("LEDGER_RPC_URL not set, using the in-process contract simulator");
            Arc::new(InMemoryLedger::new())
        }
    };
    let ledger_kind = if config.ledger_rpc_url.is_some() {
        "json-rpc"
    } else {
        "simulator"
    };

    let pool = match &config.database_url {
        Some(url) => {
            let pool = connect_database(url).await?;
            ensure_schema(&pool).await?;
            Some(pool)
        }
        None => None,
    };
    let cache: Arc<dyn CacheStore> = match &pool {
        Some(pool) => Arc::new(PgCacheStore::new(pool.clone())),
        None => {
            warn!("DATABASE_URL not set, deal cache lives in memory");
            Arc::new(InMemoryCache::default())
        }
    };
    let contacts = pool.map(PgContactDirectory::new);

    let (log_reader, log_appender): (Arc<dyn LogReader>, Option<Arc<dyn LogAppender>>) =
        match &config.mirror {
            Some(mirror) => {
                let reader = MirrorLogReader::new(
                    &mirror.base_url,
                    &mirror.topic_id,
                    config.ledger_timeout,
                )?;
                if topic_writer.is_none() {
                    warn!("no ledger gateway to submit through, deal messages will not be published");
                }
                let reader: Arc<dyn LogReader> = Arc::new(reader);
                (reader, topic_writer)
            }
            None => {
                let log = Arc::new(InMemoryLog::default());
                let reader: Arc<dyn LogReader> = log.clone();
                let appender: Arc<dyn LogAppender> = log;
                (reader, Some(appender))
            }
        };

    let mut reconciler = Reconciler::new(ledger)
        .with_cache(cache)
        .with_log_reader(log_reader)
        .with_timeout(config.ledger_timeout)
        .with_page_size(config.log_page_size);
    let publishing = log_appender.is_some();
    if let Some(appender) = log_appender {
        reconciler =
            reconciler.with_publisher(LogPublisher::new(appender, config.status_update_mode));
    }

    let mut engine = DealEngine::new(Arc::new(reconciler));
    if let Some(directory) = &contacts {
        let mailer: Arc<dyn Mailer> = match &config.redis_url {
            Some(url) => Arc::new(RedisMailer::new(RedisBus::connect(url)?)),
            None => Arc::new(LogMailer),
        };
        engine = engine.with_dispatcher(Dispatcher::spawn(
            mailer,
            Arc::new(directory.clone()),
            DEFAULT_QUEUE_CAPACITY,
        ));
    } else {
        warn!("no contact directory, notifications are disabled");
    }

    let health = HealthResponse {
        status: "ok".to_string(),
        ledger: ledger_kind.to_string(),
        cache: config.database_url.is_some(),
        consensus_log: publishing,
        notifications: contacts.is_some(),
        status_update_mode: config.status_update_mode,
    };

    Ok(AppState {
        engine,
        contacts,
        health,
    })
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.health)
}

async fn list_deals(State(state): State<AppState>) -> Json<DealListing> {
    Json(state.engine.list_deals().await)
}

async fn create_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(proposal): Json<DealProposal>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let buyer = actor(&headers)?;
    let outcome = state
        .engine
        .create_deal(&buyer, proposal)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn get_deal(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
) -> Result<Json<ReconciledDeal>, (StatusCode, String)> {
    let deal_id = parse_deal_id(&deal_id)?;
    let reconciled = state.engine.get_deal(&deal_id).await.map_err(escrow_error)?;
    Ok(Json(reconciled))
}

async fn accept_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    Json(request): Json<AcceptDealRequest>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = match request.role {
        Role::Seller => state.engine.accept_as_seller(&deal_id, &actor).await,
        Role::Arbiter => state.engine.accept_as_arbiter(&deal_id, &actor).await,
        Role::Buyer => Err(EscrowError::validation(
            "the buyer accepts by creating the deal",
        )),
    }
    .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn fund_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    Json(request): Json<FundDealRequest>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .fund_deal(&deal_id, &actor, request.amount)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn release_funds(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .release_funds(&deal_id, &actor)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn raise_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .raise_dispute(&deal_id, &actor)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn submit_evidence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    Json(request): Json<SubmitEvidenceRequest>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .submit_evidence(&deal_id, &actor, &request.evidence_hash)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn vote_on_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .vote_on_dispute(&deal_id, &actor, request.release_to_seller)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn refund_buyer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
) -> Result<Json<TransitionOutcome>, (StatusCode, String)> {
    let actor = actor(&headers)?;
    let deal_id = parse_deal_id(&deal_id)?;
    let outcome = state
        .engine
        .refund_buyer(&deal_id, &actor)
        .await
        .map_err(escrow_error)?;
    Ok(Json(outcome))
}

async fn voting_status(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
) -> Result<Json<VotingStatus>, (StatusCode, String)> {
    let deal_id = parse_deal_id(&deal_id)?;
    let status = state
        .engine
        .get_voting_status(&deal_id)
        .await
        .map_err(escrow_error)?;
    Ok(Json(status))
}

/// Without a `role` filter every role's counters are returned.
async fn reputation(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<ReputationQuery>,
) -> Result<Json<Vec<Reputation>>, (StatusCode, String)> {
    let account = AccountId::parse(&account_id).map_err(escrow_error)?;
    let roles = match query.role {
        Some(role) => vec![role],
        None => vec![Role::Buyer, Role::Seller, Role::Arbiter],
    };

    let mut reputations = Vec::with_capacity(roles.len());
    for role in roles {
        reputations.push(
            state
                .engine
                .get_reputation(&account, role)
                .await
                .map_err(escrow_error)?,
        );
    }
    Ok(Json(reputations))
}

async fn register_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterContactRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let account = actor(&headers)?;
    let Some(contacts) = &state.contacts else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "contact registration requires DATABASE_URL".to_string(),
        ));
    };

    let email = request
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty());
    if let Some(email) = email {
        if !email.contains('@') {
            return Err(invalid_request(format!("'{email}' is not an email address")));
        }
    }

    contacts
        .register(&account, email)
        .await
        .map_err(internal_error)?;
    info!(%account, registered = email.is_some(), "contact updated");
    Ok(StatusCode::NO_CONTENT)
}

fn actor(headers: &HeaderMap) -> Result<AccountId, (StatusCode, String)> {
    let raw = headers
        .get(ACCOUNT_HEADER)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                format!("missing {ACCOUNT_HEADER} header"),
            )
        })?
        .to_str()
        .map_err(|_| invalid_request(format!("{ACCOUNT_HEADER} must be ASCII")))?;
    AccountId::parse(raw).map_err(escrow_error)
}

fn parse_deal_id(raw: &str) -> Result<DealId, (StatusCode, String)> {
    DealId::parse(raw).map_err(escrow_error)
}

fn escrow_error(err: EscrowError) -> (StatusCode, String) {
    let status = match &err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::Authorization(_) => StatusCode::FORBIDDEN,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::StateConflict(_) => StatusCode::CONFLICT,
        EscrowError::LedgerFailure(_) => StatusCode::BAD_GATEWAY,
        EscrowError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string())
}

fn invalid_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

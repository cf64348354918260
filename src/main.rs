use crate::api::*;
use crate::authority::{Authority, Unavailable};
use crate::chain::GatewayAuthority;
use crate::db::SQLite;
use crate::ledger::{Ledger, LedgerError, NewPrediction};
use crate::reconciler::Reconciler;
use crate::reputation::ReputationBook;
use crate::settings::Settings;
use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use axum_macros::debug_handler;
use chrono::Utc;
use clap::Parser;
use env_logger::{Builder, WriteStyle};
use log::{debug, error, info, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

mod api;
mod authority;
mod chain;
mod client;
mod db;
mod ledger;
mod policy;
mod reconciler;
mod reputation;
mod settings;

#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
    reputation: ReputationBook,
    expose_internal_errors: bool,
}

type Failure = (StatusCode, Json<ApiResponse<()>>);

#[debug_handler]
async fn create_prediction(
    State(state): State<AppState>,
    request: Result<Json<CreatePredictionRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<CreatePredictionResponse>>, Failure> {
    let Json(request) = request.map_err(map_rejection)?;
    let title = required(request.title, "title")?;
    let description = required(request.description, "description")?;
    let category = required(request.category, "category")?;
    let creator = required(request.creator, "creator")?;
    let days = request
        .voting_period_days
        .ok_or_else(|| bad_request("Missing required field: votingPeriodDays"))?;
    if !(1..=MAX_VOTING_PERIOD_DAYS).contains(&days) {
        return Err(bad_request(format!(
            "votingPeriodDays must be between 1 and {}",
            MAX_VOTING_PERIOD_DAYS
        )));
    }
    let created = state
        .reconciler
        .create_prediction(NewPrediction {
            creator,
            title,
            description,
            category,
            end_time: voting_end(Utc::now(), days),
        })
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    let message = if created.authority_id.is_some() {
        "Prediction created in the ledger and the authoritative ledger"
    } else {
        "Prediction created in the ledger (authoritative ledger unavailable)"
    };
    debug!(
        "Created prediction {} ending {}",
        created.prediction.id, created.prediction.end_time
    );
    Ok(Json(ApiResponse::ok(CreatePredictionResponse {
        id: created.prediction.id,
        authority_id: created.authority_id,
        message: message.to_string(),
    })))
}
#[debug_handler]
async fn vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<VoteResponse>>, Failure> {
    let prediction = parse_id(&id)?;
    let Json(request) = request.map_err(map_rejection)?;
    let voter = required(request.voter, "voter")?;
    let support = request
        .support
        .ok_or_else(|| bad_request("Missing required field: support"))?;
    trace!("Vote {} by {} on prediction {}", support, voter, prediction);
    let tally = state
        .reconciler
        .submit_vote(prediction, &voter, support)
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    Ok(Json(ApiResponse::ok(VoteResponse {
        prediction_id: prediction,
        voter,
        support,
        total_votes: tally.total_votes,
        yes_votes: tally.yes_votes,
        no_votes: tally.no_votes,
        is_approved: tally.status == Status::Approved,
        status: tally.status,
        message: "Vote recorded successfully".to_string(),
    })))
}
async fn get_active_predictions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Prediction>>>, Failure> {
    let predictions = state
        .reconciler
        .get_active_predictions()
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    trace!(
        "{} active predictions from {:?}",
        predictions.value.len(),
        predictions.source
    );
    Ok(Json(ApiResponse::list(predictions.value)))
}
async fn get_approved_predictions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Prediction>>>, Failure> {
    let predictions = state
        .reconciler
        .get_approved_predictions()
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    trace!(
        "{} approved predictions from {:?}",
        predictions.value.len(),
        predictions.source
    );
    Ok(Json(ApiResponse::list(predictions.value)))
}
async fn get_prediction_count(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CountResponse>>, Failure> {
    let count = state
        .reconciler
        .get_prediction_count()
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    Ok(Json(ApiResponse::ok(CountResponse {
        total_predictions: count.value,
    })))
}
async fn get_prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PredictionDetailResponse>>, Failure> {
    let prediction = parse_id(&id)?;
    let ledger = state.reconciler.ledger();
    let expose = state.expose_internal_errors;
    let prediction = ledger
        .get_prediction(prediction)
        .await
        .map_err(|e| map_ledger_err(e, expose))?;
    let votes = ledger
        .get_votes(prediction.id)
        .await
        .map_err(|e| map_ledger_err(e, expose))?;
    let voting_stats = ledger
        .voting_stats(prediction.id)
        .await
        .map_err(|e| map_ledger_err(e, expose))?;
    Ok(Json(ApiResponse::ok(PredictionDetailResponse {
        prediction,
        votes,
        voting_stats,
    })))
}
async fn get_voting_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<VotingStats>>, Failure> {
    let prediction = parse_id(&id)?;
    let stats = state
        .reconciler
        .ledger()
        .voting_stats(prediction)
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    Ok(Json(ApiResponse::ok(stats)))
}
async fn has_voted(
    State(state): State<AppState>,
    Path((id, voter)): Path<(String, String)>,
) -> Result<Json<ApiResponse<HasVotedResponse>>, Failure> {
    let prediction = parse_id(&id)?;
    let has_voted = state
        .reconciler
        .ledger()
        .has_voted(prediction, &voter)
        .await
        .map_err(|e| map_ledger_err(e, state.expose_internal_errors))?;
    Ok(Json(ApiResponse::ok(HasVotedResponse {
        has_voted,
        prediction_id: prediction,
        voter,
    })))
}
async fn get_profile(
    State(state): State<AppState>,
    Path(creator): Path<String>,
) -> Result<Json<ApiResponse<Profile>>, Failure> {
    let profile = state
        .reputation
        .get_profile(&creator)
        .await
        .map_err(|e| map_ledger_err(e.into(), state.expose_internal_errors))?;
    match profile {
        Some(profile) => Ok(Json(ApiResponse::ok(profile))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::failure(
                format!("No profile for {}", creator),
                None,
            )),
        )),
    }
}
async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let (authority_configured, authority_reachable) = state.reconciler.authority_status().await;
    Json(ApiResponse::ok(HealthResponse {
        authority_configured,
        authority_reachable,
        timestamp: Utc::now(),
    }))
}

fn bad_request(message: impl Into<String>) -> Failure {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::failure(message, None)),
    )
}
fn required(field: Option<String>, name: &str) -> Result<String, Failure> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(bad_request(format!("Missing required field: {}", name))),
    }
}
fn parse_id(id: &str) -> Result<RowId, Failure> {
    id.parse()
        .map_err(|_| bad_request(format!("Invalid prediction id: {}", id)))
}
fn map_rejection(rejection: JsonRejection) -> Failure {
    bad_request(rejection.body_text())
}
fn map_ledger_err(e: LedgerError, expose_internal_errors: bool) -> Failure {
    let code = match &e {
        LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::DuplicateVote { .. } => StatusCode::CONFLICT,
        LedgerError::VotingClosed(_) => StatusCode::GONE,
        LedgerError::Internal(e) => {
            error!("{:#}", e);
            let error = expose_internal_errors.then(|| format!("{:#}", e));
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failure("Something went wrong", error)),
            );
        }
    };
    (code, Json(ApiResponse::failure(e.to_string(), None)))
}

fn authority_from(settings: &Settings) -> Arc<dyn Authority + Send + Sync> {
    match &settings.authority.url {
        Some(url) => Arc::new(GatewayAuthority::new(
            url.clone(),
            settings.authority.api_key.clone(),
        )),
        None => {
            info!("No authoritative ledger configured, running on the ledger only");
            Arc::new(Unavailable)
        }
    }
}

#[derive(Parser)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    db: Option<String>,
    /// Contract gateway url
    #[arg(short, long)]
    authority: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(db) = cli.db {
        settings.db.url = db;
    }
    if cli.authority.is_some() {
        settings.authority.url = cli.authority;
    }
    Builder::default()
        .filter_level(settings.log_level()?)
        .parse_default_env()
        .write_style(WriteStyle::Always)
        .init();
    let authority = authority_from(&settings);
    let (_port, handle) = run_server(&settings, authority).await?;
    handle.await?;
    Ok(())
}

async fn app_state(
    settings: &Settings,
    authority: Arc<dyn Authority + Send + Sync>,
) -> Result<AppState> {
    let db = SQLite::new(Some(settings.db.url.clone())).await?;
    let reputation = ReputationBook::new(Box::new(db.clone()));
    let ledger = Ledger::new(Box::new(db), Box::new(reputation.clone()));
    let redelivered = ledger.redeliver_approvals().await?;
    if redelivered > 0 {
        info!("Redelivered {} pending approvals", redelivered);
    }
    Ok(AppState {
        reconciler: Arc::new(Reconciler::new(
            Arc::new(ledger),
            authority,
            settings.authority.timeout(),
        )),
        reputation,
        expose_internal_errors: settings.server.expose_internal_errors,
    })
}

fn serve(state: AppState, port: u16) -> Result<(u16, JoinHandle<()>)> {
    let app = Router::new()
        .route("/predictions/create", post(create_prediction))
        .route("/predictions/active", get(get_active_predictions))
        .route("/predictions/approved", get(get_approved_predictions))
        .route("/predictions/count", get(get_prediction_count))
        .route("/predictions/:id", get(get_prediction))
        .route("/predictions/:id/vote", post(vote))
        .route("/predictions/:id/voting-stats", get(get_voting_stats))
        .route("/predictions/:id/has-voted/:voter", get(has_voted))
        .route("/profiles/:creator", get(get_profile))
        .route("/health", get(health))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    let port = server.local_addr().port();
    debug!("Listening on {}", server.local_addr());
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server stopped: {}", e);
        }
    });
    Ok((port, handle))
}

async fn run_server(
    settings: &Settings,
    authority: Arc<dyn Authority + Send + Sync>,
) -> Result<(u16, JoinHandle<()>)> {
    let state = app_state(settings, authority).await?;
    serve(state, settings.server.port)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::authority::test::TestAuthority;
    use crate::client::Client;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.server.port = 0;
        settings.authority.timeout_ms = 200;
        settings
    }
    async fn start(authority: Arc<dyn Authority + Send + Sync>) -> (AppState, Client) {
        let state = app_state(&test_settings(), authority).await.unwrap();
        let (port, _) = serve(state.clone(), 0).unwrap();
        let client = Client::new("http://127.0.0.1:".to_string() + port.to_string().as_str());
        (state, client)
    }
    fn create_request(days: u32) -> CreatePredictionRequest {
        CreatePredictionRequest {
            title: Some("BTC above 100k".into()),
            description: Some("Bitcoin closes above 100k USD this quarter".into()),
            category: Some("crypto".into()),
            voting_period_days: Some(days),
            creator: Some("0xcreator".into()),
        }
    }

    #[tokio::test]
    async fn prediction_lifecycle() {
        let (_, client) = start(Arc::new(TestAuthority::failing())).await;
        assert_eq!(client.get_prediction_count().await.unwrap(), 0);

        let created = client.create_prediction(&create_request(7)).await.unwrap();
        assert_eq!(created.authority_id, None);
        let id = created.id;
        let active = client.get_active_predictions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "BTC above 100k");

        for i in 0..3 {
            let response = client.vote(id, &format!("0xno{}", i), false).await.unwrap();
            assert_eq!(response.status, Status::Active);
        }
        for i in 0..6 {
            let response = client.vote(id, &format!("0xyes{}", i), true).await.unwrap();
            assert!(!response.is_approved);
        }
        let response = client.vote(id, "0xyes6", true).await.unwrap();
        assert!(response.is_approved);
        assert_eq!((response.yes_votes, response.no_votes), (7, 3));
        assert_eq!(response.total_votes, 10);

        assert!(client.get_active_predictions().await.unwrap().is_empty());
        let approved = client.get_approved_predictions().await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].id, id);
        assert_eq!(client.get_prediction_count().await.unwrap(), 1);

        let detail = client.get_prediction(id).await.unwrap();
        assert_eq!(detail.prediction.status, Status::Approved);
        assert_eq!(detail.votes.len(), 10);
        assert_eq!(detail.voting_stats.approval_percentage, dec!(70));
        let stats = client.get_voting_stats(id).await.unwrap();
        assert_eq!(stats, detail.voting_stats);

        assert!(client.has_voted(id, "0xno0").await.unwrap());
        assert!(!client.has_voted(id, "0xsomeone").await.unwrap());
        let body = client
            .get(&format!("/predictions/{}/has-voted/0xno0", id))
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        assert_eq!(body["data"]["userAddress"], "0xno0");
        assert_eq!(body["data"]["hasVoted"], true);

        let profile = client.get_profile("0xcreator").await.unwrap();
        assert_eq!(profile.predictions_created, 1);
        assert_eq!(profile.predictions_approved, 1);
        assert_eq!(profile.reputation, 5);
    }
    #[tokio::test]
    async fn error_codes() {
        let (state, client) = start(Arc::new(Unavailable)).await;
        let id = client.create_prediction(&create_request(1)).await.unwrap().id;
        client.vote(id, "0xv1", true).await.unwrap();

        let vote = VoteRequest {
            voter: Some("0xv2".into()),
            support: Some(false),
        };
        let response = client.post_vote(id, &vote).await.unwrap();
        // Already approved by the first vote.
        assert_eq!(response.status(), StatusCode::GONE);
        let body = response.json::<ApiResponse<()>>().await.unwrap();
        assert!(!body.success);
        assert!(body.message.is_some());

        let id = client.create_prediction(&create_request(1)).await.unwrap().id;
        client.vote(id, "0xv1", false).await.unwrap();
        let duplicate = VoteRequest {
            voter: Some("0xv1".into()),
            support: Some(true),
        };
        let response = client.post_vote(id, &duplicate).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = client.post_vote(999, &duplicate).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let missing = VoteRequest {
            voter: Some("0xv3".into()),
            support: None,
        };
        let response = client.post_vote(id, &missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let expired = state
            .reconciler
            .ledger()
            .create_prediction(NewPrediction {
                creator: "0xcreator".into(),
                title: "Expired".into(),
                description: "Ended a minute ago".into(),
                category: "misc".into(),
                end_time: Utc::now() - Duration::minutes(1),
            })
            .await
            .unwrap();
        let response = client.post_vote(expired.id, &duplicate).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        let detail = client.get_prediction(expired.id).await.unwrap();
        assert_eq!(detail.prediction.status, Status::Closed);

        for path in [
            "/predictions/abc",
            "/predictions/abc/voting-stats",
            "/predictions/abc/has-voted/0xv1",
        ] {
            assert_eq!(
                client.get(path).await.unwrap().status(),
                StatusCode::BAD_REQUEST
            );
        }
        for path in [
            "/predictions/999",
            "/predictions/999/voting-stats",
            "/predictions/999/has-voted/0xv1",
            "/profiles/0xnobody",
        ] {
            assert_eq!(client.get(path).await.unwrap().status(), StatusCode::NOT_FOUND);
        }
    }
    #[tokio::test]
    async fn create_validation() {
        let (_, client) = start(Arc::new(Unavailable)).await;
        for days in [0, MAX_VOTING_PERIOD_DAYS + 1] {
            let response = client.post_create(&create_request(days)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        let mut request = create_request(3);
        request.title = Some("   ".into());
        let response = client.post_create(&request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.json::<ApiResponse<()>>().await.unwrap();
        assert_eq!(
            body.message.as_deref(),
            Some("Missing required field: title")
        );

        let response = reqwest::Client::new()
            .post(client.url().to_string() + "/predictions/create")
            .json(&serde_json::json!({
                "title": "ETH flips BTC",
                "description": "By market cap",
                "category": "crypto",
                "votingPeriod": 3,
                "creator": "0xcreator",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = reqwest::Client::new()
            .post(client.url().to_string() + "/predictions/create")
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(client.get_prediction_count().await.unwrap(), 1);
    }
    #[tokio::test]
    async fn health_reports_authority() {
        let (_, client) = start(Arc::new(Unavailable)).await;
        let health = client.health().await.unwrap();
        assert!(!health.authority_configured);
        assert!(!health.authority_reachable);

        let authority = Arc::new(TestAuthority::default());
        let (_, client) = start(authority.clone()).await;
        let health = client.health().await.unwrap();
        assert!(health.authority_configured && health.authority_reachable);
        let created = client.create_prediction(&create_request(3)).await.unwrap();
        assert_eq!(created.authority_id, Some(1));
        client.vote(created.id, "0xv1", false).await.unwrap();
        assert_eq!(authority.votes(), 1);

        authority.set_failing(true);
        let health = client.health().await.unwrap();
        assert!(health.authority_configured && !health.authority_reachable);
        // The ledger answers once the authority is gone.
        assert_eq!(client.get_active_predictions().await.unwrap()[0].no_votes, 1);
    }
}

use crate::agent::{Agent, AgentError, ChatBackend};
use crate::places::{Coordinates, GooglePlacesClient, Place, PlacesError, PlacesService};
use crate::protocol::{ErrorBody, SendMessageRequest};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use std::error::Error;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub struct ServerConfig {
    pub listen: String,
    pub places_api_key: String,
    pub places_base_url: String,
    pub search_radius: u32,
    pub place_type: String,
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub model: String,
}

#[derive(Clone)]
pub struct AppState {
    places: Arc<PlacesService>,
    chat: Arc<dyn ChatBackend>,
}

impl AppState {
    pub fn new(places: PlacesService, chat: Arc<dyn ChatBackend>) -> Self {
        Self {
            places: Arc::new(places),
            chat,
        }
    }
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let places = PlacesService::new(
        Box::new(GooglePlacesClient::new(
            &config.places_base_url,
            config.places_api_key,
        )),
        config.search_radius,
        config.place_type,
    );
    let agent = Agent::new(config.anthropic_api_key)
        .with_base_url(&config.anthropic_base_url)
        .with_model(config.model);

    let app = create_router(AppState::new(places, Arc::new(agent)));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "trekmate server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::PATCH,
            Method::POST,
            Method::DELETE,
        ])
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health))
        .route("/nearby", any(nearby))
        .route("/message", post(send_message))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn nearby(
    State(state): State<AppState>,
    method: Method,
    query: Option<Query<Vec<(String, String)>>>,
) -> Result<Json<Vec<Place>>, PlacesError> {
    if method != Method::GET {
        return Err(PlacesError::MethodNotAllowed);
    }

    let Some(Query(pairs)) = query else {
        return Err(PlacesError::InvalidParameters);
    };
    let coordinates = Coordinates::from_query(&pairs)?;

    let places = state.places.nearby(coordinates).await?;
    Ok(Json(places))
}

async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> Response {
    tracing::debug!(messages = payload.messages.len(), "chat message received");

    match state.chat.stream_reply(&payload.messages).await {
        Ok(stream) => (
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(AgentError::EmptyConversation) => {
            tracing::warn!("chat request without a user message");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("No user message provided")),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "chat completion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Internal Server Error")),
            )
                .into_response()
        }
    }
}

use crate::protocol::ErrorBody;
use async_trait::async_trait;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PLACES_BASE_URL: &str = "https://maps.googleapis.com";
pub const DEFAULT_SEARCH_RADIUS: u32 = 5000;
pub const DEFAULT_PLACE_TYPE: &str = "doctor";

const NEARBY_SEARCH_PATH: &str = "/maps/api/place/nearbysearch/json";

const LATITUDE_KEYS: &[&str] = &["latitude", "latitud"];
const LONGITUDE_KEYS: &[&str] = &["longitude", "longitud"];

#[derive(Debug, thiserror::Error)]
pub enum PlacesError {
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("upstream returned status {0}")]
    Upstream(String),
    #[error("upstream request failed: {0}")]
    Network(String),
}

impl IntoResponse for PlacesError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PlacesError::InvalidParameters => (StatusCode::BAD_REQUEST, "Invalid Parameters"),
            PlacesError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
            }
            PlacesError::Upstream(_) | PlacesError::Network(_) => {
                tracing::error!(error = %self, "nearby search failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };

        (status, Json(ErrorBody::new(message))).into_response()
    }
}

/// Coordinates exactly as the caller sent them. They are forwarded upstream
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub latitude: String,
    pub longitude: String,
}

impl Coordinates {
    /// Each coordinate must appear exactly once. A repeated key would be an
    /// array rather than a single string and is rejected like a missing one.
    pub fn from_query(pairs: &[(String, String)]) -> Result<Self, PlacesError> {
        Ok(Self {
            latitude: single_value(pairs, LATITUDE_KEYS)?,
            longitude: single_value(pairs, LONGITUDE_KEYS)?,
        })
    }
}

fn single_value(pairs: &[(String, String)], keys: &[&str]) -> Result<String, PlacesError> {
    let mut values = pairs
        .iter()
        .filter(|(key, _)| keys.contains(&key.as_str()))
        .map(|(_, value)| value);

    match (values.next(), values.next()) {
        (Some(value), None) => Ok(value.clone()),
        _ => Err(PlacesError::InvalidParameters),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearbySearch {
    pub coordinates: Coordinates,
    pub radius: u32,
    pub place_type: String,
}

#[derive(Debug, Deserialize)]
pub struct NearbySearchResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<UpstreamPlace>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Fields are kept as raw JSON so an odd-shaped record is passed through
/// instead of failing the whole response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamPlace {
    pub name: Option<Value>,
    pub vicinity: Option<Value>,
    pub rating: Option<Value>,
    pub opening_hours: Option<Value>,
    pub photos: Option<Value>,
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photos: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Value>,
}

impl From<UpstreamPlace> for Place {
    fn from(place: UpstreamPlace) -> Self {
        Self {
            name: place.name,
            address: place.vicinity,
            rating: place.rating,
            opening_info: place.opening_hours,
            photos: place.photos,
            geometry: place.geometry,
        }
    }
}

#[async_trait]
pub trait PlacesClient: Send + Sync {
    async fn nearby_search(
        &self,
        request: &NearbySearch,
    ) -> Result<NearbySearchResponse, PlacesError>;
}

pub struct GooglePlacesClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GooglePlacesClient {
    pub fn new(base_url: &str, api_key: String) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn search_url(&self, request: &NearbySearch) -> Result<Url, PlacesError> {
        let location = format!(
            "{},{}",
            request.coordinates.latitude, request.coordinates.longitude
        );
        let radius = request.radius.to_string();

        Url::parse_with_params(
            &format!("{}{}", self.base_url, NEARBY_SEARCH_PATH),
            &[
                ("location", location.as_str()),
                ("radius", radius.as_str()),
                ("type", request.place_type.as_str()),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|e| PlacesError::Network(e.to_string()))
    }
}

#[async_trait]
impl PlacesClient for GooglePlacesClient {
    async fn nearby_search(
        &self,
        request: &NearbySearch,
    ) -> Result<NearbySearchResponse, PlacesError> {
        let url = self.search_url(request)?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PlacesError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| PlacesError::Network(e.to_string()))
    }
}

pub struct PlacesService {
    client: Box<dyn PlacesClient>,
    radius: u32,
    place_type: String,
}

impl PlacesService {
    pub fn new(client: Box<dyn PlacesClient>, radius: u32, place_type: String) -> Self {
        Self {
            client,
            radius,
            place_type,
        }
    }

    pub async fn nearby(&self, coordinates: Coordinates) -> Result<Vec<Place>, PlacesError> {
        let request = NearbySearch {
            coordinates,
            radius: self.radius,
            place_type: self.place_type.clone(),
        };

        let response = self.client.nearby_search(&request).await?;
        if response.status != "OK" {
            let status = match response.error_message {
                Some(detail) => format!("{} ({})", response.status, detail),
                None => response.status,
            };
            return Err(PlacesError::Upstream(status));
        }

        tracing::debug!(
            latitude = %request.coordinates.latitude,
            longitude = %request.coordinates.longitude,
            results = response.results.len(),
            "nearby search succeeded"
        );
        Ok(response.results.into_iter().map(Place::from).collect())
    }
}

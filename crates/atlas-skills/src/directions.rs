use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use atlas_core::{Error, Result};

/// Route request. At most one of `departure_time` / `arrival_time` may be
/// set; both absent means "leave now".
#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub origin: String,
    pub destination: String,
    pub departure_time: Option<DateTime<Utc>>,
    pub arrival_time: Option<DateTime<Utc>>,
}

impl RouteQuery {
    pub fn now(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            departure_time: None,
            arrival_time: None,
        }
    }

    pub fn arriving_at(mut self, at: DateTime<Utc>) -> Self {
        self.arrival_time = Some(at);
        self
    }

    pub fn departing_at(mut self, at: DateTime<Utc>) -> Self {
        self.departure_time = Some(at);
        self
    }
}

/// One computed route.
#[derive(Debug, Clone)]
pub struct Route {
    pub summary: Option<String>,
    pub distance_text: Option<String>,
    /// Nominal travel time.
    pub duration: Duration,
    /// Travel time adjusted for current traffic, when the API provides it.
    pub duration_in_traffic: Option<Duration>,
}

impl Route {
    /// Traffic-aware duration when available, nominal otherwise.
    pub fn effective_duration(&self) -> Duration {
        self.duration_in_traffic.unwrap_or(self.duration)
    }
}

/// Seam over the external directions service.
#[async_trait]
pub trait DirectionsApi: Send + Sync {
    async fn route(&self, query: &RouteQuery) -> Result<Route>;
}

/// Client for the Google Maps Directions API.
pub struct GoogleDirections {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

const DIRECTIONS_TIMEOUT_SECS: u64 = 10;

impl GoogleDirections {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://maps.googleapis.com".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    routes: Vec<ApiRoute>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ApiRoute {
    #[serde(default)]
    summary: Option<String>,
    legs: Vec<ApiLeg>,
}

#[derive(Deserialize)]
struct ApiLeg {
    duration: ApiValue,
    #[serde(default)]
    duration_in_traffic: Option<ApiValue>,
    #[serde(default)]
    distance: Option<ApiText>,
}

#[derive(Deserialize)]
struct ApiValue {
    /// Seconds.
    value: i64,
}

#[derive(Deserialize)]
struct ApiText {
    text: String,
}

#[async_trait]
impl DirectionsApi for GoogleDirections {
    async fn route(&self, query: &RouteQuery) -> Result<Route> {
        let url = format!("{}/maps/api/directions/json", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("origin", query.origin.clone()),
            ("destination", query.destination.clone()),
            ("key", self.api_key.clone()),
        ];
        if let Some(dep) = query.departure_time {
            params.push(("departure_time", dep.timestamp().to_string()));
        } else if let Some(arr) = query.arrival_time {
            params.push(("arrival_time", arr.timestamp().to_string()));
        } else {
            // "now" asks the API for live traffic on the nominal route.
            params.push(("departure_time", "now".to_string()));
        }

        debug!(origin = %query.origin, destination = %query.destination, "directions request");

        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(DIRECTIONS_TIMEOUT_SECS))
            .query(&params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::upstream(format!(
                "directions API returned HTTP {status}"
            )));
        }

        let parsed: DirectionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed directions payload: {e}")))?;

        if parsed.status != "OK" {
            let detail = parsed.error_message.unwrap_or_default();
            return Err(Error::upstream(format!(
                "directions API status {}: {detail}",
                parsed.status
            )));
        }

        let route = parsed
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream("directions API returned no routes"))?;
        let leg = route
            .legs
            .first()
            .ok_or_else(|| Error::upstream("directions route has no legs"))?;

        Ok(Route {
            summary: route.summary.clone(),
            distance_text: leg.distance.as_ref().map(|d| d.text.clone()),
            duration: Duration::seconds(leg.duration.value),
            duration_in_traffic: leg
                .duration_in_traffic
                .as_ref()
                .map(|d| Duration::seconds(d.value)),
        })
    }
}

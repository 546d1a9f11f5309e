use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde_json::{json, Value};

use atlas_skills::{DirectionsApi, Route, RouteQuery};

use super::{required_str, Tool, ToolResult};

/// Route lookup between two places, optionally pinned to a departure or
/// arrival time.
pub struct DirectionsTool {
    api: Arc<dyn DirectionsApi>,
}

impl DirectionsTool {
    pub fn new(api: Arc<dyn DirectionsApi>) -> Self {
        Self { api }
    }
}

fn parse_time(args: &Value, key: &str) -> Result<Option<DateTime<Utc>>, String> {
    match args.get(key).and_then(|v| v.as_str()) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("'{key}' must be an ISO-8601 datetime: {e}")),
    }
}

fn render_route(route: &Route, arrival_time: Option<DateTime<Utc>>) -> String {
    let mut out = String::new();
    if let Some(summary) = &route.summary {
        out.push_str(&format!("Route: via {summary}\n"));
    }
    if let Some(distance) = &route.distance_text {
        out.push_str(&format!("Distance: {distance}\n"));
    }
    out.push_str(&format!(
        "Duration: {} min",
        route.duration.num_minutes()
    ));
    if let Some(traffic) = route.duration_in_traffic {
        out.push_str(&format!(" ({} min in current traffic)", traffic.num_minutes()));
    }
    out.push('\n');

    if let Some(arrival) = arrival_time {
        let leave_by = arrival - route.effective_duration();
        out.push_str(&format!(
            "Leave by {} to arrive by {}\n",
            leave_by.with_timezone(&Local).format("%H:%M"),
            arrival.with_timezone(&Local).format("%H:%M"),
        ));
    }
    out
}

#[async_trait]
impl Tool for DirectionsTool {
    fn name(&self) -> &str {
        "directions"
    }

    fn description(&self) -> &str {
        "Get driving directions and travel time between two places. Pass \
         arrival_time to learn when to leave, or departure_time to plan a \
         future trip; with neither the route reflects leaving now."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "origin": {
                    "type": "string",
                    "description": "Start address or place name."
                },
                "destination": {
                    "type": "string",
                    "description": "End address or place name."
                },
                "departure_time": {
                    "type": "string",
                    "description": "ISO-8601 departure instant. Mutually exclusive with arrival_time."
                },
                "arrival_time": {
                    "type": "string",
                    "description": "ISO-8601 arrival target. Mutually exclusive with departure_time."
                }
            },
            "required": ["origin", "destination"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let origin = match required_str(&args, "origin") {
            Ok(o) => o,
            Err(msg) => return ToolResult::error(msg),
        };
        let destination = match required_str(&args, "destination") {
            Ok(d) => d,
            Err(msg) => return ToolResult::error(msg),
        };
        let departure = match parse_time(&args, "departure_time") {
            Ok(d) => d,
            Err(msg) => return ToolResult::error(msg),
        };
        let arrival = match parse_time(&args, "arrival_time") {
            Ok(a) => a,
            Err(msg) => return ToolResult::error(msg),
        };
        if departure.is_some() && arrival.is_some() {
            return ToolResult::error(
                "set at most one of departure_time and arrival_time, not both",
            );
        }

        let mut query = RouteQuery::now(origin, destination);
        if let Some(dep) = departure {
            query = query.departing_at(dep);
        }
        if let Some(arr) = arrival {
            query = query.arriving_at(arr);
        }

        match self.api.route(&query).await {
            Ok(route) => ToolResult::success(render_route(&route, arrival)),
            Err(e) => ToolResult::error(format!("directions lookup failed: {e}")),
        }
    }
}

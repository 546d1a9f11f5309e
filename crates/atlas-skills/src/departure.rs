use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use atlas_core::{Notification, Push};

use crate::directions::{DirectionsApi, RouteQuery};
use crate::{Skill, SkillContext, SkillResult};

/// Watches live traffic and pushes a "Time to leave" notification when the
/// latest viable departure moment approaches.
pub struct DepartureCheckSkill {
    directions: Arc<dyn DirectionsApi>,
    push: Arc<dyn Push>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepartureConfig {
    #[serde(default = "default_version")]
    #[allow(dead_code)]
    version: u32,
    origin: String,
    destination: String,
    /// Local wall-clock arrival target, "HH:MM".
    arrival_time: String,
    #[serde(default = "default_lead_minutes")]
    lead_minutes: i64,
    #[serde(default = "default_poll_minutes")]
    poll_interval_minutes: i64,
}

fn default_version() -> u32 {
    1
}

fn default_lead_minutes() -> i64 {
    7
}

fn default_poll_minutes() -> i64 {
    5
}

/// Outcome of one polling iteration.
#[derive(Debug, PartialEq, Eq)]
enum Check {
    /// The arrival target already passed; nothing left to watch.
    Past,
    /// Departure moment is within the lead window.
    Leave { leave_by: DateTime<Utc> },
    /// Still early; poll again later.
    Wait,
}

/// Decide what to do given the clock, the target and the travel time.
fn assess(
    now: DateTime<Utc>,
    arrival: DateTime<Utc>,
    travel: Duration,
    lead: Duration,
) -> Check {
    if arrival <= now {
        return Check::Past;
    }
    let leave_by = arrival - travel;
    if leave_by <= now + lead {
        Check::Leave { leave_by }
    } else {
        Check::Wait
    }
}

/// Today's occurrence of `HH:MM` local time, as a UTC instant.
fn today_arrival(now_local: DateTime<Local>, hhmm: &str) -> Result<DateTime<Utc>, String> {
    let time = NaiveTime::parse_from_str(hhmm, "%H:%M")
        .map_err(|e| format!("arrivalTime must be HH:MM: {e}"))?;
    let naive = now_local.date_naive().and_time(time);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("arrival time {hhmm} does not exist today"))
}

impl DepartureCheckSkill {
    pub fn new(directions: Arc<dyn DirectionsApi>, push: Arc<dyn Push>) -> Self {
        Self { directions, push }
    }
}

#[async_trait]
impl Skill for DepartureCheckSkill {
    fn name(&self) -> &str {
        "departure-check"
    }

    fn description(&self) -> &str {
        "Polls live traffic for a trip with a target arrival time and sends a \
         'Time to leave' notification when the latest viable departure moment \
         is within the configured lead window."
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "version": {"type": "integer", "const": 1},
                "origin": {"type": "string", "description": "Trip start address or place."},
                "destination": {"type": "string", "description": "Trip end address or place."},
                "arrivalTime": {
                    "type": "string",
                    "pattern": "^\\d{2}:\\d{2}$",
                    "description": "Local arrival target, HH:MM."
                },
                "leadMinutes": {
                    "type": "integer",
                    "default": 7,
                    "description": "Notify when departure is due within this many minutes."
                },
                "pollIntervalMinutes": {
                    "type": "integer",
                    "default": 5,
                    "description": "Minutes between traffic checks."
                }
            },
            "required": ["origin", "destination", "arrivalTime"]
        })
    }

    async fn execute(&self, ctx: SkillContext) -> SkillResult {
        let config: DepartureConfig = match serde_json::from_value(ctx.job.config.clone()) {
            Ok(c) => c,
            Err(e) => return SkillResult::failed(format!("invalid departure-check config: {e}")),
        };
        let lead = Duration::minutes(config.lead_minutes);
        let poll = std::time::Duration::from_secs(config.poll_interval_minutes.max(1) as u64 * 60);

        loop {
            if ctx.cancel.is_cancelled() {
                return SkillResult::ok("Aborted");
            }

            let arrival = match today_arrival(Local::now(), &config.arrival_time) {
                Ok(a) => a,
                Err(e) => return SkillResult::failed(e),
            };
            let now = Utc::now();

            if arrival <= now {
                return SkillResult::ok_and_disable("Past arrival time");
            }

            let query = RouteQuery::now(&config.origin, &config.destination).arriving_at(arrival);
            match self.directions.route(&query).await {
                Ok(route) => {
                    let travel = route.effective_duration();
                    if let Check::Leave { leave_by } = assess(now, arrival, travel, lead) {
                        let leave_local = leave_by.with_timezone(&Local);
                        let minutes = travel.num_minutes();
                        self.push
                            .notify(
                                Notification::new(
                                    "Time to leave",
                                    format!(
                                        "Leave by {} to reach {} by {} ({minutes} min drive)",
                                        leave_local.format("%H:%M"),
                                        config.destination,
                                        config.arrival_time,
                                    ),
                                )
                                .tag("car"),
                            )
                            .await;
                        info!(job_id = ctx.job.id, %leave_by, "departure notification sent");
                        return SkillResult::ok_and_disable(format!(
                            "Notification sent: leave by {}",
                            leave_local.format("%H:%M")
                        ));
                    }
                }
                Err(e) => {
                    // Traffic hiccups must not kill the watch.
                    warn!(job_id = ctx.job.id, error = %e, "directions check failed, will retry");
                }
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => return SkillResult::ok("Aborted"),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

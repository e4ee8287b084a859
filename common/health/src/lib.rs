//! Liveness tracking for the long-running loops of a pipeline process.
//!
//! Every loop registers a component with a deadline, then keeps reporting
//! healthy more often than that deadline. The process is live only while
//! every registered component is live:
//!   - a component that never reported yet is `Starting`, which fails the check
//!   - a component that reported `Unhealthy` fails the check
//!   - a component whose last healthy report is older than its deadline is `Stalled`
//!
//! A registry with no components at all is unhealthy, so a probe cannot pass
//! before the loops it guards have started.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report received yet
    Starting,
    /// Reported healthy, must report again before the given time
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// The healthy deadline passed without a new report
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handed to a component so it can report on its own schedule.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = self.component, "poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status of the process, usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let effective = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and by the relay actors.
//!
//! All mutable data lives behind `Arc<RwLock<T>>`:
//! - **Arc**: every handler and relay actor holds a cheap clone of the state
//! - **RwLock**: many concurrent readers, one writer at a time
//!
//! The relay actors update metrics from inside actix contexts, so every lock
//! here is the std (blocking) RwLock with short critical sections: a counter
//! bump or a config clone, never I/O.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The application state shared across handlers and relay connections.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime via the config API)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance and relay traffic metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (immutable, so no lock needed)
    pub start_time: Instant,
}

/// Metrics collected across HTTP requests and relayed connections.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors since server start (HTTP and relay)
    pub error_count: u64,

    /// Current number of open relay connections
    pub active_relays: u32,

    /// Binary frames forwarded browser -> backend
    pub upstream_frames: u64,

    /// Bytes forwarded browser -> backend
    pub upstream_bytes: u64,

    /// Binary frames forwarded backend -> browser
    pub downstream_frames: u64,

    /// Bytes forwarded backend -> browser
    pub downstream_bytes: u64,

    /// Per-endpoint statistics, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this endpoint
    pub request_count: u64,

    /// Total time spent processing requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors for this endpoint
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so relay dials and request
    /// handlers never block each other. AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Connections already in flight keep the settings they were dialed
    /// with; the new values apply to connections opened afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter.
    ///
    /// Covers both failed HTTP requests and relay legs that ended with a
    /// transport failure.
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A relay connection was accepted from a browser.
    pub fn relay_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_relays += 1;
    }

    /// A relay connection finished (either side closed).
    pub fn relay_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Guard against underflow if close is ever double-reported.
        if metrics.active_relays > 0 {
            metrics.active_relays -= 1;
        }
    }

    /// Account one binary frame forwarded browser -> backend.
    pub fn record_upstream(&self, bytes: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.upstream_frames += 1;
        metrics.upstream_bytes += bytes;
    }

    /// Account one binary frame forwarded backend -> browser.
    pub fn record_downstream(&self, bytes: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.downstream_frames += 1;
        metrics.downstream_bytes += bytes;
    }

    /// Get a consistent snapshot of the metrics for the /metrics endpoint.
    ///
    /// Clones under a read lock so serialization happens without holding it.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_relays: metrics.active_relays,
            upstream_frames: metrics.upstream_frames,
            upstream_bytes: metrics.upstream_bytes,
            downstream_frames: metrics.downstream_frames,
            downstream_bytes: metrics.downstream_bytes,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

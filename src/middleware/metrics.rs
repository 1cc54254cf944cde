use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// The relay upgrade path; handshakes get their own metrics bucket.
const RELAY_PATH: &str = "/ws/voice";

/// Records per-endpoint request counts, latency and error totals into
/// [`AppState`].
///
/// The relay upgrade is accounted separately from plain HTTP traffic: it is
/// keyed as `WS /ws/voice`, only the handshake is timed (relayed frames are
/// accounted by the relay actor), and anything but a successful protocol
/// switch counts as a handshake error.
pub struct MetricsMiddleware;

/// Metrics key for one request. Relay handshakes share a single bucket
/// regardless of query parameters or method quirks.
fn endpoint_key(method: &str, path: &str) -> String {
    if path == RELAY_PATH {
        format!("WS {}", RELAY_PATH)
    } else {
        format!("{} {}", method, path)
    }
}

/// Whether a response counts as an error for metrics purposes.
///
/// A relay handshake succeeds only by switching protocols; a 4xx/5xx rule
/// would let a failed upgrade that still returned 200 slip through.
fn response_is_error(status: StatusCode, relay_upgrade: bool) -> bool {
    if relay_upgrade {
        status != StatusCode::SWITCHING_PROTOCOLS
    } else {
        status.is_client_error() || status.is_server_error()
    }
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let relay_upgrade = req.uri().path() == RELAY_PATH;
        let endpoint = endpoint_key(req.method().as_str(), req.uri().path());

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response_is_error(response.status(), relay_upgrade),
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keys() {
        assert_eq!(endpoint_key("GET", "/health"), "GET /health");
        assert_eq!(endpoint_key("PUT", "/api/v1/config"), "PUT /api/v1/config");
        // Relay handshakes collapse into one bucket.
        assert_eq!(endpoint_key("GET", "/ws/voice"), "WS /ws/voice");
    }

    #[test]
    fn test_http_error_classification() {
        assert!(!response_is_error(StatusCode::OK, false));
        assert!(!response_is_error(StatusCode::NO_CONTENT, false));
        assert!(response_is_error(StatusCode::BAD_REQUEST, false));
        assert!(response_is_error(StatusCode::INTERNAL_SERVER_ERROR, false));
    }

    #[test]
    fn test_relay_handshake_error_classification() {
        // Only a protocol switch is a successful handshake.
        assert!(!response_is_error(StatusCode::SWITCHING_PROTOCOLS, true));
        assert!(response_is_error(StatusCode::OK, true));
        assert!(response_is_error(StatusCode::BAD_REQUEST, true));
    }
}

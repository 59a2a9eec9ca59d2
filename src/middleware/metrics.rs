//! # Request Metrics Middleware
//!
//! Times every HTTP request and records it in [`AppState`] under its route
//! pattern (`GET /api/v1/sessions/{client_id}`), so per-client paths do not
//! explode the endpoint table. 4xx and 5xx responses count as errors.

use crate::state::AppState;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error};
use std::time::Instant;

pub async fn track_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let started = Instant::now();
    let state = req.app_data::<web::Data<AppState>>().cloned();
    let route = req
        .match_pattern()
        .unwrap_or_else(|| req.path().to_string());
    let endpoint = format!("{} {}", req.method(), route);

    let result = next.call(req).await;

    let is_error = match &result {
        Ok(response) => {
            response.status().is_client_error() || response.status().is_server_error()
        }
        Err(_) => true,
    };

    if let Some(state) = state {
        state.record_endpoint_request(&endpoint, started.elapsed().as_millis() as u64, is_error);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::middleware::from_fn;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_recorded_by_route() {
        let (state, _) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(from_fn(track_metrics))
                .route("/items/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/fail", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        for path in ["/items/1", "/items/2", "/fail"] {
            test::call_service(&app, test::TestRequest::get().uri(path).to_request()).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /items/{id}"].request_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /fail"].error_count, 1);
    }
}

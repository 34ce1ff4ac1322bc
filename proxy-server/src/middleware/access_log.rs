// proxy-server/src/middleware/access_log.rs
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use proxy_common::iso_timestamp;

/// Emits one line per inbound request: method, ISO-8601 timestamp, path
/// and query, before the request is handled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AccessLogMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLogMiddleware { service }))
    }
}

pub struct AccessLogMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<ServiceResponse<B>, Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        tracing::info!(
            "{} {} {} {}",
            req.method(),
            iso_timestamp(),
            req.path(),
            req.query_string()
        );

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            tracing::debug!("{} -> {}", res.request().path(), res.status());
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_pass_through() {
        let app = test::init_service(
            App::new()
                .wrap(AccessLog)
                .route("/hello", web::get().to(|| async { HttpResponse::Ok().body("hi") })),
        )
        .await;

        let req = test::TestRequest::get().uri("/hello?x=1").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, web::Bytes::from_static(b"hi"));
    }
}

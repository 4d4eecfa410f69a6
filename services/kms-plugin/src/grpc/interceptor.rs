//! Tower layer timing every gRPC call.
//!
//! Reports `grpc_<method>` into the request histogram. The gRPC status of a
//! failed unary call travels in the response headers (trailers-only
//! response), which is where it is read from.

use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::debug;

use crate::metrics::{STATUS_ERROR, STATUS_SUCCESS, StatsReporter};

/// Layer adding [`MetricsService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer {
    reporter: StatsReporter,
}

impl MetricsLayer {
    /// Layer reporting through `reporter`.
    #[must_use]
    pub const fn new(reporter: StatsReporter) -> Self {
        Self { reporter }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            reporter: self.reporter,
        }
    }
}

/// Service wrapper timing each call.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    reporter: StatsReporter,
}

/// `grpc_<method>` from `/package.Service/Method`.
#[must_use]
pub fn operation_name(path: &str) -> String {
    let method = path.rsplit('/').next().unwrap_or_default();
    format!("grpc_{}", method.to_ascii_lowercase())
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; swap so the ready service handles this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let reporter = self.reporter;
        let operation = operation_name(req.uri().path());

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let seconds = start.elapsed().as_secs_f64();

            match &result {
                Ok(response) => match tonic::Status::from_header_map(response.headers()) {
                    Some(status) if status.code() != tonic::Code::Ok => {
                        let code = format!("{:?}", status.code());
                        debug!(operation = %operation, code = %code, "grpc call failed");
                        reporter.report_request(&operation, STATUS_ERROR, seconds, &code);
                    }
                    _ => reporter.report_request(&operation, STATUS_SUCCESS, seconds, ""),
                },
                Err(_) => reporter.report_request(&operation, STATUS_ERROR, seconds, "transport"),
            }
            result
        })
    }
}

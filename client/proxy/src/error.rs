use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request path does not resolve to a usable target URL.
    #[error("invalid proxy target: {0}")]
    BadTarget(&'static str),
    /// The target failed the SSRF / mirror allowlist checks.
    #[error("target not allowed")]
    BlockedTarget,
    /// Package misses with no source to fetch from.
    #[error("package not found")]
    NotFound,
    /// The upstream answered with a definite status we pass along.
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    /// Upstream transport/retry failure.
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
    /// Multi-source download failed (including hash verification).
    #[error("download failed: {0}")]
    Download(String),
    /// The cache could not produce a blob it claimed to have.
    #[error("cache read failed: {0}")]
    Cache(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadTarget(_) | ProxyError::BlockedTarget => StatusCode::BAD_REQUEST,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            // Definite upstream answers (404 and friends) pass through so
            // APT's probing works; upstream 5xx collapses to 502.
            ProxyError::UpstreamStatus(status) => StatusCode::from_u16(*status)
                .ok()
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::Upstream(_) | ProxyError::Download(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Detail stays in the logs; clients get the concise line.
        tracing::debug!(target: "proxy", error = %self, status = %status, "request failed");
        let response = (status, self.to_string()).into_response();
        with_security_headers(response)
    }
}

/// Headers applied to JSON/admin and error responses.
pub fn with_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

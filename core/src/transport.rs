//! Resilient JSON-over-HTTP client.
//!
//! Every call runs the request interceptors once, then up to `retries + 1`
//! sequential attempts. Each attempt races the backend against its own
//! deadline and the caller's cancellation token. Between attempts the client
//! sleeps `retry_delay * 2^(n-1)` before attempt `n`.

use crate::error::ApiClientError;
use crate::http::{HttpBackend, HttpRequest, HttpResponse, Method};
use crate::observer::{Observers, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Delay awaited before attempt `attempt` (1-based retry index).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeout: None,
            retries: None,
            retry_delay: None,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiClientError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ApiClientError::validation(format!("unserializable body: {err}")))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

pub trait RequestInterceptor: Send + Sync {
    fn on_request(&self, config: RequestConfig) -> Result<RequestConfig, ApiClientError>;
}

impl<F> RequestInterceptor for F
where
    F: Fn(RequestConfig) -> Result<RequestConfig, ApiClientError> + Send + Sync,
{
    fn on_request(&self, config: RequestConfig) -> Result<RequestConfig, ApiClientError> {
        self(config)
    }
}

pub trait ResponseInterceptor: Send + Sync {
    fn on_response(&self, response: HttpResponse) -> HttpResponse;
}

impl<F> ResponseInterceptor for F
where
    F: Fn(HttpResponse) -> HttpResponse + Send + Sync,
{
    fn on_response(&self, response: HttpResponse) -> HttpResponse {
        self(response)
    }
}

pub trait ErrorInterceptor: Send + Sync {
    fn on_error(&self, error: ApiClientError) -> ApiClientError;
}

impl<F> ErrorInterceptor for F
where
    F: Fn(ApiClientError) -> ApiClientError + Send + Sync,
{
    fn on_error(&self, error: ApiClientError) -> ApiClientError {
        self(error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingState {
    pub is_loading: bool,
    pub operation: Option<String>,
}

/// Last-write-wins loading flag shared by every call of one client.
#[derive(Default)]
pub struct LoadingStateHub {
    state: Mutex<LoadingState>,
    observers: Observers<LoadingState>,
}

impl LoadingStateHub {
    pub fn current(&self) -> LoadingState {
        self.state.lock().clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&LoadingState) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn begin(&self, operation: String) {
        self.publish(|state| {
            state.is_loading = true;
            state.operation = Some(operation);
        });
    }

    fn finish(&self) {
        self.publish(|state| state.is_loading = false);
    }

    fn publish(&self, update: impl FnOnce(&mut LoadingState)) {
        let snapshot = {
            let mut state = self.state.lock();
            update(&mut state);
            state.clone()
        };
        self.observers.notify(&snapshot);
    }
}

/// Hands out one cancellation token per call and aborts the previous one, so
/// the most recent caller wins.
#[derive(Default)]
pub struct InFlight {
    current: Mutex<Option<CancellationToken>>,
}

impl InFlight {
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl TransportSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    backend: Arc<dyn HttpBackend>,
    settings: TransportSettings,
    request_interceptors: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response_interceptors: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
    error_interceptors: RwLock<Vec<Arc<dyn ErrorInterceptor>>>,
    loading: LoadingStateHub,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl ApiClient {
    pub fn new(backend: Arc<dyn HttpBackend>, settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                backend,
                settings,
                request_interceptors: RwLock::new(Vec::new()),
                response_interceptors: RwLock::new(Vec::new()),
                error_interceptors: RwLock::new(Vec::new()),
                loading: LoadingStateHub::default(),
            }),
        }
    }

    /// Client with the default interceptors: the `X-Requested-With` header and
    /// error logging.
    pub fn with_defaults(backend: Arc<dyn HttpBackend>, settings: TransportSettings) -> Self {
        let client = Self::new(backend, settings);
        client.add_request_interceptor(|config: RequestConfig| -> Result<_, ApiClientError> {
            if config.has_header("X-Requested-With") {
                return Ok(config);
            }
            Ok(config.header("X-Requested-With", "XMLHttpRequest"))
        });
        client.add_error_interceptor(|error: ApiClientError| {
            warn!(%error, status = ?error.status(), "api error");
            error
        });
        client
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    pub fn loading(&self) -> &LoadingStateHub {
        &self.inner.loading
    }

    pub fn add_request_interceptor(&self, interceptor: impl RequestInterceptor + 'static) {
        self.inner
            .request_interceptors
            .write()
            .push(Arc::new(interceptor));
    }

    pub fn add_response_interceptor(&self, interceptor: impl ResponseInterceptor + 'static) {
        self.inner
            .response_interceptors
            .write()
            .push(Arc::new(interceptor));
    }

    pub fn add_error_interceptor(&self, interceptor: impl ErrorInterceptor + 'static) {
        self.inner
            .error_interceptors
            .write()
            .push(Arc::new(interceptor));
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiClientError> {
        self.send_json(RequestConfig::get(path)).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(RequestConfig::post(path).json(body)?).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(RequestConfig::put(path).json(body)?).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(RequestConfig::patch(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiClientError> {
        self.send_json(RequestConfig::delete(path)).await
    }

    /// Runs the call and decodes the 2xx body as JSON. Reading and decoding
    /// the body is part of the attempt, so a body cut short is retried.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        config: RequestConfig,
    ) -> Result<T, ApiClientError> {
        self.execute(config, |response| async move {
            let status = response.status;
            let bytes = response.bytes().await.map_err(ApiClientError::from)?;
            serde_json::from_slice(&bytes).map_err(|err| {
                debug!(status, %err, "undecodable response body");
                ApiClientError::api(format!("Invalid response body: {err}"), None)
            })
        })
        .await
    }

    /// Runs the call and hands back the 2xx response with its body unread.
    /// The deadline covers the response head only.
    pub async fn open(&self, config: RequestConfig) -> Result<HttpResponse, ApiClientError> {
        self.execute(config, |response| async move { Ok(response) })
            .await
    }

    async fn execute<T, F, Fut>(&self, config: RequestConfig, finish: F) -> Result<T, ApiClientError>
    where
        F: Fn(HttpResponse) -> Fut,
        Fut: Future<Output = Result<T, ApiClientError>>,
    {
        let config = match self.apply_request_interceptors(config) {
            Ok(config) => config,
            Err(err) => return Err(self.apply_error_interceptors(err)),
        };
        let template = match self.build_request(&config) {
            Ok(request) => request,
            Err(err) => return Err(self.apply_error_interceptors(err)),
        };

        let settings = &self.inner.settings;
        let timeout = config.timeout.unwrap_or(settings.timeout);
        let retries = config.retries.unwrap_or(settings.retries);
        let retry_delay = config.retry_delay.unwrap_or(settings.retry_delay);
        let cancel = config.cancel.clone().unwrap_or_default();
        let operation = format!("{} {}", config.method, config.path);

        self.inner.loading.begin(operation.clone());

        let mut last_error = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                let delay = backoff_delay(retry_delay, attempt);
                debug!(%operation, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    last_error = Some(ApiClientError::Cancelled);
                    break;
                }
            }

            match self
                .attempt(template.clone(), timeout, &cancel, &finish)
                .await
            {
                Ok(value) => {
                    self.inner.loading.finish();
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        %operation,
                        attempt = attempt + 1,
                        max_attempts = retries + 1,
                        error = %err,
                        "request attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        self.inner.loading.finish();
        let err = last_error.unwrap_or_else(|| {
            ApiClientError::api("Request failed after all retry attempts", None)
        });
        Err(self.apply_error_interceptors(err))
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: HttpRequest,
        timeout: Duration,
        cancel: &CancellationToken,
        finish: &F,
    ) -> Result<T, ApiClientError>
    where
        F: Fn(HttpResponse) -> Fut,
        Fut: Future<Output = Result<T, ApiClientError>>,
    {
        let exchange = async {
            let response = self.inner.backend.send(request).await?;
            let response = self.apply_response_interceptors(response);
            if !response.is_success() {
                return Err(error_from_response(response).await);
            }
            finish(response).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiClientError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(ApiClientError::Timeout { after: timeout }),
            result = exchange => result,
        }
    }

    fn build_request(&self, config: &RequestConfig) -> Result<HttpRequest, ApiClientError> {
        let mut url = self.resolve_url(&config.path)?;
        if !config.query.is_empty() {
            url.query_pairs_mut().extend_pairs(config.query.iter());
        }

        let mut headers = vec![("Content-Type".to_owned(), "application/json".to_owned())];
        for (name, value) in &config.headers {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        let body = match (&config.body, config.method.carries_body()) {
            (Some(body), true) => Some(serde_json::to_vec(body).map_err(|err| {
                ApiClientError::validation(format!("unserializable body: {err}"))
            })?),
            _ => None,
        };

        Ok(HttpRequest {
            method: config.method,
            url,
            headers,
            body,
        })
    }

    fn resolve_url(&self, path: &str) -> Result<Url, ApiClientError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!(
                "{}{}",
                self.inner.settings.base_url.trim_end_matches('/'),
                path
            )
        };
        Url::parse(&raw).map_err(|err| ApiClientError::validation(format!("invalid url {raw}: {err}")))
    }

    fn apply_request_interceptors(
        &self,
        config: RequestConfig,
    ) -> Result<RequestConfig, ApiClientError> {
        let interceptors = self.inner.request_interceptors.read().clone();
        interceptors
            .iter()
            .try_fold(config, |config, interceptor| interceptor.on_request(config))
    }

    fn apply_response_interceptors(&self, response: HttpResponse) -> HttpResponse {
        let interceptors = self.inner.response_interceptors.read().clone();
        interceptors
            .iter()
            .fold(response, |response, interceptor| interceptor.on_response(response))
    }

    fn apply_error_interceptors(&self, error: ApiClientError) -> ApiClientError {
        let interceptors = self.inner.error_interceptors.read().clone();
        interceptors
            .iter()
            .fold(error, |error, interceptor| interceptor.on_error(error))
    }
}

async fn error_from_response(response: HttpResponse) -> ApiClientError {
    let status = response.status;
    let fallback = if response.reason.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", response.reason)
    };
    let parsed = response
        .bytes()
        .await
        .ok()
        .and_then(|bytes| serde_json::from_slice::<ErrorBody>(&bytes).ok());

    match parsed {
        Some(ErrorBody {
            error: Some(kind),
            message,
        }) if status == 400 && kind == "ValidationError" => {
            ApiClientError::validation(message.unwrap_or(kind))
        }
        Some(ErrorBody { error, message }) => {
            ApiClientError::api(message.or(error).unwrap_or(fallback), Some(status))
        }
        None => ApiClientError::api(fallback, Some(status)),
    }
}

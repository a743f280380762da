use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bon::Builder;
use reqwest::Client as ReqwestClient;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::cache::{CacheKey, DEFAULT_CACHE_TIME, ResponseCache};
use super::config::{RequestConfig, RequestOverrides};
use super::retry::RetryConfig;
use super::send_request;
use crate::Result;
use crate::error::Error;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type SettledCallback = Arc<dyn Fn() + Send + Sync>;

/// Issues HTTP calls against one host and hands out [`CallSite`]s sharing its cache.
#[derive(Clone, Debug)]
pub struct Executor {
    host: Url,
    client: ReqwestClient,
    cache: ResponseCache,
}

impl Executor {
    /// Create an executor for `host` that stores responses in `cache`.
    pub fn new(host: &str, cache: ResponseCache) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert("User-Agent", HeaderValue::from_static("dashlink"));
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        // Paths are joined relative to the host, so a base path must end in '/'
        let mut host = Url::parse(host)?;
        if !host.path().ends_with('/') {
            let path = format!("{}/", host.path());
            host.set_path(&path);
        }

        Ok(Self {
            host,
            client,
            cache,
        })
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Create a call site for `path`, decoding responses into `T`.
    #[must_use]
    pub fn call_site<T>(
        &self,
        path: &str,
        config: RequestConfig,
        options: CallOptions<T>,
    ) -> CallSite<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (state_tx, _) = watch::channel(CallState::default());

        CallSite {
            inner: Arc::new(CallInner {
                executor: self.clone(),
                path: path.to_owned(),
                base: config,
                options,
                state_tx,
                control: Mutex::new(Control::default()),
            }),
        }
    }

    async fn fetch(&self, path: &str, config: &RequestConfig) -> Result<Value> {
        let url = self.host.join(path.trim_start_matches('/'))?;

        let mut headers = HeaderMap::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::validation(format!("invalid header name {name}: {e}")))?;
            headers.insert(name, HeaderValue::from_str(value)?);
        }

        let mut builder = self
            .client
            .request(config.method.clone(), url)
            .headers(headers);
        if !config.query.is_empty() {
            builder = builder.query(&config.query);
        }
        if let Some(body) = &config.body {
            builder = builder.json(body);
        }
        let request = builder.build()?;

        match config.timeout {
            Some(after) => timeout(after, send_request(&self.client, request))
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(Error::timeout(format!("{} {path}", config.method), after))
                }),
            None => send_request(&self.client, request).await,
        }
    }
}

/// Behavior of one call site.
#[derive(Builder)]
#[non_exhaustive]
pub struct CallOptions<T> {
    /// How long a response stays fresh in the cache and in [`CallSite::is_stale`]
    #[builder(default = DEFAULT_CACHE_TIME)]
    pub cache_time: Duration,
    /// Schedule retries after failures until the retry budget is used up
    #[builder(default = true)]
    pub auto_retry: bool,
    /// Refetch stale data when [`CallSite::focus`] is called
    #[builder(default = true)]
    pub refetch_on_focus: bool,
    #[builder(default)]
    pub retry: RetryConfig,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<T> fmt::Debug for CallOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("cache_time", &self.cache_time)
            .field("auto_retry", &self.auto_retry)
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("retry", &self.retry)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// Observable state of a call site.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CallState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<Arc<Error>>,
    pub success: bool,
    /// Consecutive failed attempts since the last success
    pub retry_count: u32,
    /// When `data` was fetched; for cached data, when the cache entry was stored
    pub last_updated: Option<Instant>,
}

impl<T> Default for CallState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            success: false,
            retry_count: 0,
            last_updated: None,
        }
    }
}

/// A logical request with its own state, cancellation and retry schedule.
///
/// A new [`execute`](Self::execute) cancels the attempt still in flight; only the latest attempt
/// can change the state. Clones share the call site. Once [`teardown`](Self::teardown) ran, or the
/// last clone was dropped, nothing changes the state anymore.
pub struct CallSite<T> {
    inner: Arc<CallInner<T>>,
}

impl<T> Clone for CallSite<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CallSite<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("path", &self.inner.path)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

struct CallInner<T> {
    executor: Executor,
    path: String,
    base: RequestConfig,
    options: CallOptions<T>,
    state_tx: watch::Sender<CallState<T>>,
    control: Mutex<Control>,
}

struct Control {
    alive: bool,
    /// Incremented by every attempt that reaches the network
    attempt_id: u64,
    in_flight: Option<CancellationToken>,
    retry_timer: Option<JoinHandle<()>>,
    last_overrides: RequestOverrides,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            alive: true,
            attempt_id: 0,
            in_flight: None,
            retry_timer: None,
            last_overrides: RequestOverrides::default(),
        }
    }
}

impl Control {
    fn stop(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

impl<T> CallSite<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Run the call with the base configuration.
    ///
    /// Served from the cache when a fresh entry exists. A superseded, cancelled or torn-down
    /// attempt returns an error for which [`Error::is_cancelled`] holds and leaves the state alone.
    /// Dropping the future, or [`cancel`](Self::cancel), abandons the current attempt: `loading`
    /// is cleared and `on_settled` still runs.
    pub async fn execute(&self) -> Result<T> {
        self.inner.run(RequestOverrides::default()).await
    }

    /// Run the call with `overrides` merged into the base configuration.
    pub async fn execute_with(&self, overrides: RequestOverrides) -> Result<T> {
        self.inner.run(overrides).await
    }

    /// Drop the cached response for the last configuration and fetch it again.
    pub async fn refetch(&self) -> Result<T> {
        self.inner.refetch().await
    }

    /// Run the last configuration again with a fresh retry budget.
    pub async fn retry(&self) -> Result<T> {
        let overrides = {
            let control = self.inner.lock();
            if !control.alive {
                return Err(Error::cancelled());
            }
            self.inner
                .state_tx
                .send_modify(|state| state.retry_count = 0);
            control.last_overrides.clone()
        };
        self.inner.run(overrides).await
    }

    /// Abort the attempt in flight and any scheduled retry. Later calls are unaffected.
    pub fn cancel(&self) {
        let mut control = self.inner.lock();
        if !control.alive {
            return;
        }
        control.stop();
        self.inner
            .state_tx
            .send_modify(|state| state.loading = false);
    }

    /// Window regained focus: refetch in the background when enabled and the data is stale.
    ///
    /// Returns whether a refetch was started.
    pub fn focus(&self) -> bool {
        if !self.inner.options.refetch_on_focus || !self.is_stale() || !self.inner.lock().alive {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.refetch().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %inner.path, error = %e, "refetch on focus failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        });
        true
    }

    /// Whether there is no data yet or it is older than `cache_time`.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.inner
            .state_tx
            .borrow()
            .last_updated
            .is_none_or(|updated| updated.elapsed() >= self.inner.options.cache_time)
    }

    /// Stop everything; no timer, retry or in-flight call changes the state afterwards.
    pub fn teardown(&self) {
        let mut control = self.inner.lock();
        control.alive = false;
        control.stop();
    }

    #[must_use]
    pub fn state(&self) -> CallState<T> {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver notified whenever the state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CallState<T>> {
        self.inner.state_tx.subscribe()
    }

    /// Cache key of the base configuration with `overrides` applied.
    pub fn cache_key(&self, overrides: &RequestOverrides) -> Result<CacheKey> {
        CacheKey::fingerprint(&self.inner.path, &self.inner.base.merge(overrides))
    }
}

impl<T> CallInner<T> {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_alive(&self) -> bool {
        self.lock().alive
    }

    /// Completion callback; never called once the call site is torn down.
    fn settled(&self) {
        if let Some(on_settled) = &self.options.on_settled
            && self.is_alive()
        {
            on_settled();
        }
    }
}

impl<T> CallInner<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn refetch(self: &Arc<Self>) -> Result<T> {
        let overrides = self.lock().last_overrides.clone();
        let key = CacheKey::fingerprint(&self.path, &self.base.merge(&overrides))?;
        self.executor.cache.invalidate(&key);
        self.run(overrides).await
    }

    async fn run(self: &Arc<Self>, overrides: RequestOverrides) -> Result<T> {
        let config = self.base.merge(&overrides);
        let key = CacheKey::fingerprint(&self.path, &config)?;

        let (attempt_id, token) = {
            let mut control = self.lock();
            if !control.alive {
                return Err(Error::cancelled());
            }
            control.last_overrides = overrides;

            if let Some(entry) = self.executor.cache.get_fresh(&key) {
                let data: T = serde_json::from_value(entry.value)?;
                self.state_tx.send_modify(|state| {
                    state.data = Some(data.clone());
                    state.loading = false;
                    state.error = None;
                    state.success = true;
                    state.last_updated = Some(entry.stored_at);
                });
                return Ok(data);
            }

            control.stop();
            control.attempt_id += 1;
            let token = CancellationToken::new();
            control.in_flight = Some(token.clone());
            self.state_tx.send_modify(|state| {
                state.loading = true;
                state.error = None;
                state.success = false;
            });
            (control.attempt_id, token)
        };

        let mut guard = AttemptGuard {
            inner: self,
            attempt_id,
            token: token.clone(),
            armed: true,
        };

        let fetched = tokio::select! {
            () = token.cancelled() => return Err(Error::cancelled()),
            result = self.executor.fetch(&self.path, &config) => result,
        };
        let decoded = fetched.and_then(|value| {
            let data: T = serde_json::from_value(value.clone())?;
            Ok((value, data))
        });

        let mut control = self.lock();
        if !control.alive || control.attempt_id != attempt_id || token.is_cancelled() {
            return Err(Error::cancelled());
        }
        control.in_flight = None;
        guard.disarm();

        match decoded {
            Ok((value, data)) => {
                self.executor
                    .cache
                    .insert(key, value, self.options.cache_time);
                self.state_tx.send_modify(|state| {
                    state.data = Some(data.clone());
                    state.loading = false;
                    state.error = None;
                    state.success = true;
                    state.retry_count = 0;
                    state.last_updated = Some(Instant::now());
                });
                drop(control);

                if let Some(on_success) = &self.options.on_success
                    && self.is_alive()
                {
                    on_success(&data);
                }
                self.settled();
                Ok(data)
            }
            Err(error) => {
                let retry_count = self.state_tx.borrow().retry_count.saturating_add(1);
                let exhausted = retry_count > config.retries;
                let retry = self.options.auto_retry && !exhausted && error.is_retryable();

                let error = if exhausted {
                    Error::max_retries_exceeded(retry_count, error)
                } else {
                    error
                };

                #[cfg(feature = "tracing")]
                tracing::warn!(path = %self.path, retry_count, retry, error = %error, "call failed");

                let error = Arc::new(error);
                self.state_tx.send_modify(|state| {
                    state.loading = false;
                    state.success = false;
                    state.retry_count = retry_count;
                    state.error = Some(Arc::clone(&error));
                });
                if retry {
                    let delay = self.options.retry.delay(retry_count);
                    control.retry_timer =
                        Some(spawn_retry(Arc::downgrade(self), attempt_id, delay));
                }
                drop(control);

                if let Some(on_error) = &self.options.on_error
                    && self.is_alive()
                {
                    on_error(&error);
                }
                self.settled();
                Err(Error::shared(&error))
            }
        }
    }
}

/// Ends an attempt that finishes without a response: cancelled through its token, or dropped by
/// the caller mid-flight.
///
/// Cancels the token and, while the attempt is still the current one of a live call site, clears
/// `loading` and reports the attempt as settled. Superseded attempts leave the state to their
/// successor.
struct AttemptGuard<'call, T> {
    inner: &'call CallInner<T>,
    attempt_id: u64,
    token: CancellationToken,
    armed: bool,
}

impl<T> AttemptGuard<'_, T> {
    /// The attempt produced an outcome and settles itself.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T> Drop for AttemptGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.token.cancel();

        let mut control = self.inner.lock();
        if !control.alive || control.attempt_id != self.attempt_id {
            return;
        }
        control.in_flight = None;
        self.inner
            .state_tx
            .send_modify(|state| state.loading = false);
        drop(control);

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %self.inner.path, attempt_id = self.attempt_id, "call abandoned");
        self.inner.settled();
    }
}

/// Replay the last configuration after `delay`, unless a newer attempt or a teardown came first.
fn spawn_retry<T>(inner: Weak<CallInner<T>>, attempt_id: u64, delay: Duration) -> JoinHandle<()>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let overrides = {
            let mut control = inner.lock();
            if !control.alive || control.attempt_id != attempt_id {
                return;
            }
            // This is the running timer; detach it so the next attempt does not abort it
            drop(control.retry_timer.take());
            control.last_overrides.clone()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %inner.path, ?delay, "retrying call");
        _ = inner.run(overrides).await;
    })
}

impl<T> Drop for CallInner<T> {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        control.alive = false;
        control.stop();
    }
}

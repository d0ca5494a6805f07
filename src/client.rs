use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::header::{
    HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, USER_AGENT,
};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use crate::destination::{
    ChallengeChecker, ChallengeOutcome, DestinationPolicy, DestinationResolver, NoChallenge,
    SharedChallengeChecker, SharedResolver,
};
use crate::entity::Entity;
use crate::error::{classify_io_error, HttpError};
use crate::handle::{ConnectionHandle, LiveConnection, ResponseHead, DEFAULT_ATTEMPTS};
use crate::progress::ProgressReader;
use crate::request::{RedirectAction, RequestDescriptor};
use crate::response::{Charset, Response};
use crate::throttle::ConnectionThrottle;
use crate::util::{
    authority_key, is_acceptable_status, is_redirect_status, is_tls_downgrade, lock_unpoisoned,
    redirect_location, resolve_redirect_uri, status_message,
};
use crate::validator::Validator;

const DEFAULT_USER_AGENT: &str = concat!("reqflow/", env!("CARGO_PKG_VERSION"));

/// Transport agents are cached per connection-relevant configuration, so the
/// pool stays bounded by the number of configured destinations. Timeouts are
/// applied per request, not per agent.
#[derive(Clone, PartialEq, Eq, Hash)]
struct AgentKey {
    proxy: Option<String>,
    verify_tls: bool,
}

pub struct HttpClientBuilder {
    resolver: SharedResolver,
    challenge: SharedChallengeChecker,
    user_agent: String,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        struct HostResolver;
        impl DestinationResolver for HostResolver {}
        Self {
            resolver: Arc::new(HostResolver),
            challenge: Arc::new(NoChallenge),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl HttpClientBuilder {
    pub fn resolver(mut self, resolver: impl DestinationResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn challenge_checker(mut self, checker: impl ChallengeChecker + 'static) -> Self {
        self.challenge = Arc::new(checker);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> HttpClient {
        HttpClient {
            resolver: self.resolver,
            challenge: self.challenge,
            user_agent: self.user_agent,
            throttle: ConnectionThrottle::new(),
            agents: Mutex::new(HashMap::new()),
        }
    }
}

/// Blocking request-execution engine. Owns the throttle state and the cached
/// transport agents; one instance is shared across threads, and each call
/// blocks the calling thread until its retry/redirect loop terminates.
pub struct HttpClient {
    resolver: SharedResolver,
    challenge: SharedChallengeChecker,
    user_agent: String,
    throttle: ConnectionThrottle,
    agents: Mutex<HashMap<AgentKey, ureq::Agent>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the request through the connect/transfer/redirect/retry loop and
    /// leaves the handle holding an unread body on success. The caller pulls
    /// the body with [`ConnectionHandle::read`] and may cancel from any
    /// thread at any point.
    pub fn execute(
        &self,
        descriptor: &RequestDescriptor,
        handle: &ConnectionHandle,
    ) -> Result<(), HttpError> {
        let requested_uri = descriptor.uri().clone();
        handle.init_request(requested_uri.clone(), DEFAULT_ATTEMPTS);
        let outcome = self.run_attempt_loop(descriptor, handle, requested_uri);
        if outcome.is_err() {
            handle.disconnect_and_clear();
        }
        outcome
    }

    /// One-shot convenience: execute on a fresh handle, then buffer and
    /// decode the body. HEAD requests release the transport and return an
    /// empty response without a body read.
    pub fn fetch(&self, descriptor: &RequestDescriptor) -> Result<Response, HttpError> {
        let handle = ConnectionHandle::new();
        self.execute(descriptor, &handle)?;
        if descriptor.method() == Method::HEAD {
            handle.disconnect_and_clear();
            return Ok(Response::new(bytes::Bytes::new(), Charset::default()));
        }
        handle.read()
    }

    fn run_attempt_loop(
        &self,
        descriptor: &RequestDescriptor,
        handle: &ConnectionHandle,
        mut current_uri: Uri,
    ) -> Result<(), HttpError> {
        let cancel = handle.cancel_token();
        let read_timeout_ms = descriptor.read_timeout.as_millis();
        let mut current_method = descriptor.method().clone();
        let mut body_dropped = false;
        let mut last_error: Option<HttpError> = None;

        loop {
            // Checked before every connection attempt, the first included, so
            // a budget of N yields at most N attempts. Exhaustion surfaces
            // the last concrete failure, not a generic retry error.
            if !handle.next_attempt() {
                return Err(last_error.unwrap_or(HttpError::Disconnected));
            }
            let host = validate_scheme(&current_uri)?;
            handle.check_disconnected()?;

            let destination = self.resolver.destination(host);
            let policy = self.resolver.policy(&destination);

            if let Some(delay) = descriptor.delay {
                if let Some(authority) = authority_key(&current_uri) {
                    self.throttle.wait_delay(&authority, delay, &cancel)?;
                }
            }
            let slot = if policy.single_connection {
                Some(self.throttle.acquire_slot(&destination, &cancel)?)
            } else {
                None
            };
            handle.check_disconnected()?;

            let agent = self.agent_for(&policy)?;
            let entity = if body_dropped || current_method == Method::GET {
                None
            } else {
                descriptor.entity.as_ref()
            };
            let request = build_transport_request(
                descriptor,
                &self.resolver,
                &destination,
                &current_uri,
                &current_method,
                entity,
                &self.user_agent,
                handle,
            )?;

            debug!(
                method = %current_method,
                uri = %current_uri,
                destination = %destination,
                "connection attempt"
            );
            let configured_request = agent
                .configure_request(request)
                .timeout_connect(Some(descriptor.connect_timeout))
                .timeout_recv_response(Some(descriptor.read_timeout))
                .build();
            let response = match agent.run(configured_request) {
                Ok(response) => response,
                Err(error) => {
                    let classified = classify_transport_error(
                        error,
                        descriptor.connect_timeout.as_millis(),
                        read_timeout_ms,
                    );
                    if classified.is_retryable() {
                        debug!(error = %classified, "retrying after recoverable transport failure");
                        last_error = Some(classified);
                        continue;
                    }
                    return Err(classified);
                }
            };

            let (parts, body) = response.into_parts();
            let status = parts.status;
            let head = ResponseHead::new(status, parts.headers);
            handle.record_head(head.clone());

            if descriptor.check_challenge
                && self.challenge.check(&destination, &head) == ChallengeOutcome::Solved
            {
                debug!(uri = %current_uri, "interstitial challenge solved, retrying");
                last_error = Some(status_error(status));
                drop(body);
                continue;
            }

            if is_redirect_status(status) {
                if let Some(location) = redirect_location(head.headers()) {
                    let Some(target) = resolve_redirect_uri(&current_uri, &location) else {
                        return Err(HttpError::UnsupportedScheme {
                            uri: location.clone(),
                        });
                    };
                    let decision =
                        descriptor
                            .redirect_handler
                            .on_redirect(status, &current_uri, &target);
                    let target = decision.uri.unwrap_or(target);
                    match decision.action {
                        RedirectAction::Cancel => {}
                        action => {
                            if is_tls_downgrade(&current_uri, policy.verify_tls, &target) {
                                return Err(HttpError::UnsafeRedirect {
                                    uri: target.to_string(),
                                });
                            }
                            last_error = Some(status_error(status));
                            debug!(status = %status, from = %current_uri, to = %target, "following redirect");
                            drop(body);
                            if action == RedirectAction::Get {
                                current_method = Method::GET;
                                body_dropped = true;
                            }
                            handle.set_redirected_uri(Some(target.clone()));
                            handle.set_requested_uri(target.clone());
                            current_uri = target;
                            continue;
                        }
                    }
                }
            }

            if status == StatusCode::NOT_MODIFIED && descriptor.validator().is_some() {
                return Err(HttpError::NotModified);
            }

            if descriptor.success_only && !is_acceptable_status(status) {
                return Err(status_error(status));
            }

            handle.set_validator(Validator::from_headers(head.headers()));
            handle.set_connection(LiveConnection {
                head,
                body,
                listener: descriptor.input_listener.clone(),
                slot,
                read_timeout_ms,
            })?;
            return Ok(());
        }
    }

    fn agent_for(&self, policy: &DestinationPolicy) -> Result<ureq::Agent, HttpError> {
        let key = AgentKey {
            proxy: policy.proxy.clone(),
            verify_tls: policy.verify_tls,
        };
        let mut agents = lock_unpoisoned(&self.agents);
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }

        let proxy = match &policy.proxy {
            Some(proxy_uri) => Some(ureq::Proxy::new(proxy_uri).map_err(|source| {
                HttpError::Transport {
                    source: Box::new(source),
                }
            })?),
            None => None,
        };
        let tls_config = ureq::tls::TlsConfig::builder()
            .provider(ureq::tls::TlsProvider::Rustls)
            .disable_verification(!policy.verify_tls)
            .build();
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .tls_config(tls_config)
            .proxy(proxy)
            .build();
        let agent = config.new_agent();
        agents.insert(key, agent.clone());
        Ok(agent)
    }
}

fn validate_scheme(uri: &Uri) -> Result<&str, HttpError> {
    let scheme_supported = matches!(uri.scheme_str(), Some("http") | Some("https"));
    match uri.host() {
        Some(host) if scheme_supported => Ok(host),
        _ => Err(HttpError::UnsupportedScheme {
            uri: uri.to_string(),
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_transport_request(
    descriptor: &RequestDescriptor,
    resolver: &SharedResolver,
    destination: &str,
    uri: &Uri,
    method: &Method,
    entity: Option<&Entity>,
    user_agent: &str,
    handle: &ConnectionHandle,
) -> Result<http::Request<ureq::SendBody<'static>>, HttpError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &descriptor.headers {
        headers.append(name.clone(), value.clone());
    }
    let keep_alive = if descriptor.keep_alive {
        "keep-alive"
    } else {
        "close"
    };
    headers.insert(CONNECTION, HeaderValue::from_static(keep_alive));
    if !headers.contains_key(USER_AGENT) {
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }
    }
    if !headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }

    let mut cookie_value = descriptor
        .cookies
        .as_ref()
        .filter(|cookies| !cookies.is_empty())
        .map(|cookies| cookies.build())
        .unwrap_or_default();
    if let Some((name, value)) = resolver.extra_cookie(destination) {
        if !cookie_value.is_empty() {
            cookie_value.push_str("; ");
        }
        cookie_value.push_str(&name);
        cookie_value.push('=');
        cookie_value.push_str(&value);
    }
    if !cookie_value.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cookie_value) {
            headers.insert(COOKIE, value);
        }
    }

    if let Some(validator) = descriptor.validator() {
        validator.apply(&mut headers);
    }

    let body = match entity {
        Some(entity) => {
            let content_length = entity.content_length();
            if let Ok(value) = HeaderValue::from_str(&entity.content_type()) {
                headers.insert(CONTENT_TYPE, value);
            }
            headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
            let reader = ProgressReader::new(
                entity.reader(),
                handle.cancel_token(),
                descriptor.output_listener.clone(),
                Some(content_length),
            )
            .with_exact_length(content_length);
            ureq::SendBody::from_owned_reader(reader)
        }
        None => ureq::SendBody::none(),
    };

    let mut builder = http::Request::builder().method(method.clone()).uri(uri.clone());
    if let Some(request_headers) = builder.headers_mut() {
        *request_headers = headers;
    }
    builder.body(body).map_err(|source| HttpError::Transport {
        source: Box::new(source),
    })
}

fn status_error(status: StatusCode) -> HttpError {
    HttpError::HttpStatus {
        status: status.as_u16(),
        message: status_message(status),
    }
}

/// Maps a transport-level failure onto the error taxonomy. Timeouts keep
/// their phase, TLS failures split into certificate and negotiation classes,
/// and reset-class socket errors stay retryable.
fn classify_transport_error(
    error: ureq::Error,
    connect_timeout_ms: u128,
    read_timeout_ms: u128,
) -> HttpError {
    match error {
        ureq::Error::Timeout(reason) => {
            let text = reason.to_string().to_ascii_lowercase();
            if text.contains("connect") || text.contains("open") || text.contains("resolve") {
                HttpError::ConnectTimeout {
                    timeout_ms: connect_timeout_ms,
                }
            } else {
                HttpError::ReadTimeout {
                    timeout_ms: read_timeout_ms,
                }
            }
        }
        ureq::Error::ConnectionFailed | ureq::Error::ConnectProxyFailed(_) => {
            HttpError::ConnectionReset {
                source: Box::new(error),
            }
        }
        ureq::Error::Tls(message) => {
            if message.to_ascii_lowercase().contains("certificate") {
                HttpError::InvalidCertificate {
                    message: message.to_owned(),
                }
            } else {
                HttpError::TlsNegotiation {
                    message: message.to_owned(),
                }
            }
        }
        ureq::Error::Rustls(source) => {
            let message = source.to_string();
            if message.to_ascii_lowercase().contains("certificate") {
                HttpError::InvalidCertificate { message }
            } else {
                HttpError::TlsNegotiation { message }
            }
        }
        ureq::Error::Io(source) => classify_io_error(source, read_timeout_ms),
        other => HttpError::Transport {
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn scheme_validation_accepts_only_http_and_https() {
        assert!(validate_scheme(&Uri::from_static("http://host.example/")).is_ok());
        assert!(validate_scheme(&Uri::from_static("https://host.example/")).is_ok());
        assert!(matches!(
            validate_scheme(&Uri::from_static("ftp://host.example/")),
            Err(HttpError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            validate_scheme(&Uri::from_static("/relative/path")),
            Err(HttpError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn io_reset_errors_classify_as_retryable() {
        let error = classify_transport_error(
            ureq::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            15_000,
            15_000,
        );
        assert!(matches!(error, HttpError::ConnectionReset { .. }));
        assert!(error.is_retryable());
    }

    #[test]
    fn io_timeout_classifies_as_read_timeout() {
        let error = classify_transport_error(
            ureq::Error::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
            15_000,
            7_000,
        );
        assert!(matches!(error, HttpError::ReadTimeout { timeout_ms: 7_000 }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn status_errors_shorten_stock_messages() {
        let error = status_error(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error.to_string(),
            "http status 500: Internal Error"
        );
        let error = status_error(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            error.to_string(),
            "http status 503: Service Unavailable"
        );
    }
}

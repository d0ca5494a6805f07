use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, CONNECTION};
use http::{Method, StatusCode, Uri};

use crate::entity::Entity;
use crate::error::HttpError;
use crate::progress::ProgressListener;
use crate::validator::Validator;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(15_000);

/// What to do with a followed redirect. `Get` switches the retried request to
/// GET and drops the body; `Retransmit` repeats the original method and body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectAction {
    Cancel,
    Get,
    Retransmit,
}

/// Immutable redirect decision, optionally overriding the target URI.
#[derive(Clone, Debug)]
pub struct Redirect {
    pub action: RedirectAction,
    pub uri: Option<Uri>,
}

impl Redirect {
    pub fn cancel() -> Self {
        Self {
            action: RedirectAction::Cancel,
            uri: None,
        }
    }

    pub fn get() -> Self {
        Self {
            action: RedirectAction::Get,
            uri: None,
        }
    }

    pub fn retransmit() -> Self {
        Self {
            action: RedirectAction::Retransmit,
            uri: None,
        }
    }

    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }
}

/// Decides how the engine follows a redirect response.
pub trait RedirectHandler: Send + Sync {
    fn on_redirect(&self, status: StatusCode, requested: &Uri, redirected: &Uri) -> Redirect;
}

impl<F: Fn(StatusCode, &Uri, &Uri) -> Redirect + Send + Sync> RedirectHandler for F {
    fn on_redirect(&self, status: StatusCode, requested: &Uri, redirected: &Uri) -> Redirect {
        self(status, requested, redirected)
    }
}

/// Never follows; the redirect status surfaces to the caller.
pub struct NoRedirects;

impl RedirectHandler for NoRedirects {
    fn on_redirect(&self, _status: StatusCode, _requested: &Uri, _redirected: &Uri) -> Redirect {
        Redirect::cancel()
    }
}

/// Browser-like handling: every followed redirect is retried as GET.
pub struct BrowserRedirects;

impl RedirectHandler for BrowserRedirects {
    fn on_redirect(&self, _status: StatusCode, _requested: &Uri, _redirected: &Uri) -> Redirect {
        Redirect::get()
    }
}

/// Standards-strict handling: 301 and 302 retransmit the original method and
/// body, everything else switches to GET.
pub struct StrictRedirects;

impl RedirectHandler for StrictRedirects {
    fn on_redirect(&self, status: StatusCode, _requested: &Uri, _redirected: &Uri) -> Redirect {
        match status {
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => Redirect::retransmit(),
            _ => Redirect::get(),
        }
    }
}

/// Accumulates cookies into a single `Cookie` header value.
#[derive(Clone, Debug, Default)]
pub struct CookieBuilder {
    value: String,
}

impl CookieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.value.is_empty() {
            self.value.push_str("; ");
        }
        self.value.push_str(name);
        self.value.push('=');
        self.value.push_str(value);
        self
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.append(name, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn build(&self) -> String {
        self.value.clone()
    }
}

/// One logical request: target, method, body, headers, and the knobs that
/// steer the execute loop. Immutable once built; `copy()` reopens a builder
/// seeded with the same state.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) cookies: Option<CookieBuilder>,
    pub(crate) entity: Option<Entity>,
    pub(crate) success_only: bool,
    pub(crate) redirect_handler: Arc<dyn RedirectHandler>,
    pub(crate) validator: Option<Validator>,
    pub(crate) keep_alive: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) delay: Option<Duration>,
    pub(crate) check_challenge: bool,
    pub(crate) input_listener: Option<Arc<dyn ProgressListener>>,
    pub(crate) output_listener: Option<Arc<dyn ProgressListener>>,
}

impl RequestDescriptor {
    pub fn builder(method: Method, uri: Uri) -> RequestBuilder {
        RequestBuilder::new(method, uri)
    }

    pub fn get(uri: Uri) -> RequestBuilder {
        Self::builder(Method::GET, uri)
    }

    pub fn head(uri: Uri) -> RequestBuilder {
        Self::builder(Method::HEAD, uri)
    }

    pub fn post(uri: Uri, entity: impl Into<Entity>) -> RequestBuilder {
        Self::builder(Method::POST, uri).entity(entity)
    }

    pub fn put(uri: Uri, entity: impl Into<Entity>) -> RequestBuilder {
        Self::builder(Method::PUT, uri).entity(entity)
    }

    pub fn delete(uri: Uri) -> RequestBuilder {
        Self::builder(Method::DELETE, uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }

    /// Reopens this descriptor as a builder for modification.
    pub fn copy(&self) -> RequestBuilder {
        RequestBuilder {
            descriptor: self.clone(),
            error: None,
        }
    }
}

/// Builder for [`RequestDescriptor`]. Invalid input is deferred to `build()`
/// so call chains stay flat.
pub struct RequestBuilder {
    descriptor: RequestDescriptor,
    error: Option<HttpError>,
}

impl RequestBuilder {
    fn new(method: Method, uri: Uri) -> Self {
        Self {
            descriptor: RequestDescriptor {
                method,
                uri,
                headers: Vec::new(),
                cookies: None,
                entity: None,
                success_only: true,
                redirect_handler: Arc::new(BrowserRedirects),
                validator: None,
                keep_alive: true,
                connect_timeout: DEFAULT_TIMEOUT,
                read_timeout: DEFAULT_TIMEOUT,
                delay: None,
                check_challenge: true,
                input_listener: None,
                output_listener: None,
            },
            error: None,
        }
    }

    /// Appends a header; duplicates are allowed and order is preserved. The
    /// connection-control header is reserved for [`keep_alive`].
    ///
    /// [`keep_alive`]: Self::keep_alive
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        let parsed_name = match name.parse::<HeaderName>() {
            Ok(parsed) => parsed,
            Err(_) => {
                self.error = Some(HttpError::InvalidHeader {
                    name: name.to_owned(),
                });
                return self;
            }
        };
        if parsed_name == CONNECTION {
            self.error = Some(HttpError::InvalidHeader {
                name: name.to_owned(),
            });
            return self;
        }
        match value.parse::<HeaderValue>() {
            Ok(parsed_value) => self.descriptor.headers.push((parsed_name, parsed_value)),
            Err(_) => {
                self.error = Some(HttpError::InvalidHeader {
                    name: name.to_owned(),
                });
            }
        }
        self
    }

    /// Requests the inclusive byte range `start..=end` of the resource.
    pub fn range(self, start: u64, end: u64) -> Self {
        self.header("Range", &format!("bytes={start}-{end}"))
    }

    pub fn cookies(mut self, cookies: CookieBuilder) -> Self {
        self.descriptor.cookies = Some(cookies);
        self
    }

    pub fn entity(mut self, entity: impl Into<Entity>) -> Self {
        self.descriptor.entity = Some(entity.into());
        self
    }

    /// When set (the default), a status outside the accepted success range
    /// fails the request instead of handing back the response.
    pub fn success_only(mut self, success_only: bool) -> Self {
        self.descriptor.success_only = success_only;
        self
    }

    pub fn redirect_handler(mut self, handler: impl RedirectHandler + 'static) -> Self {
        self.descriptor.redirect_handler = Arc::new(handler);
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.descriptor.validator = Some(validator);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.descriptor.keep_alive = keep_alive;
        self
    }

    pub fn timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.descriptor.connect_timeout = connect;
        self.descriptor.read_timeout = read;
        self
    }

    /// Minimum spacing between requests to this host, enforced by the
    /// throttle before connecting.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.descriptor.delay = Some(delay);
        self
    }

    pub fn check_challenge(mut self, check: bool) -> Self {
        self.descriptor.check_challenge = check;
        self
    }

    /// Progress listener for the response body transfer.
    pub fn input_listener(mut self, listener: impl ProgressListener + 'static) -> Self {
        self.descriptor.input_listener = Some(Arc::new(listener));
        self
    }

    /// Progress listener for the request body transfer.
    pub fn output_listener(mut self, listener: impl ProgressListener + 'static) -> Self {
        self.descriptor.output_listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<RequestDescriptor, HttpError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.descriptor),
        }
    }
}

//! Blocking HTTP request-execution engine.
//!
//! The crate orchestrates one logical request at a time over a retried,
//! redirect-following, cancellable connection: callers build a
//! [`RequestDescriptor`], pair it with a [`ConnectionHandle`], and hand both
//! to [`HttpClient::execute`]. The handle can be disconnected or interrupted
//! from any thread while the transfer is in flight, request bodies report
//! their exact length before streaming, and shared network resources are
//! serialized per logical destination (single-connection slots and minimum
//! inter-request delays).
//!
//! ```no_run
//! use reqflow::{HttpClient, RequestDescriptor};
//!
//! # fn main() -> Result<(), reqflow::HttpError> {
//! let client = HttpClient::new();
//! let uri = http::Uri::from_static("https://example.com/data.json");
//! let descriptor = RequestDescriptor::get(uri).build()?;
//! let response = client.fetch(&descriptor)?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

mod client;
mod destination;
mod entity;
mod error;
mod handle;
mod progress;
mod request;
mod response;
mod throttle;
mod util;
mod validator;

pub use client::{HttpClient, HttpClientBuilder};
pub use destination::{
    ChallengeChecker, ChallengeOutcome, DestinationPolicy, DestinationResolver, StaticResolver,
};
pub use entity::{Entity, FileOpenable, MultipartEntity, Openable, RawEntity, UrlEncodedEntity};
pub use error::{ErrorKind, HttpError};
pub use handle::{ConnectionHandle, ResponseHead};
pub use progress::{CancelToken, ProgressListener, ProgressReader, ProgressWriter};
pub use request::{
    BrowserRedirects, CookieBuilder, NoRedirects, Redirect, RedirectAction, RedirectHandler,
    RequestBuilder, RequestDescriptor, StrictRedirects,
};
pub use response::{Charset, Response};
pub use validator::Validator;

pub type HttpResult<T> = Result<T, HttpError>;

pub mod prelude {
    pub use crate::{
        ConnectionHandle, Entity, HttpClient, HttpError, HttpResult, MultipartEntity, RawEntity,
        RequestDescriptor, Response, UrlEncodedEntity, Validator,
    };
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use crate::handle::ResponseHead;

/// Per-destination connection policy supplied by the embedding application.
#[derive(Clone, Debug)]
pub struct DestinationPolicy {
    /// Proxy URI, e.g. `http://127.0.0.1:8118` or `socks5://127.0.0.1:9050`.
    pub proxy: Option<String>,
    /// Strict certificate and hostname verification. Disabling this accepts
    /// any certificate and is only for destinations the caller explicitly
    /// opted out of.
    pub verify_tls: bool,
    /// Serialize connections: at most one in-flight connection to this
    /// destination at a time.
    pub single_connection: bool,
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            proxy: None,
            verify_tls: true,
            single_connection: false,
        }
    }
}

/// Maps host authorities to logical destination identities and supplies the
/// per-destination policy, plus any extra cookie the destination requires.
///
/// The default implementation treats every host as its own destination with
/// the default policy.
pub trait DestinationResolver: Send + Sync {
    /// Logical destination identity for a host, used as the throttle and
    /// policy key.
    fn destination(&self, host: &str) -> String {
        host.to_ascii_lowercase()
    }

    fn policy(&self, destination: &str) -> DestinationPolicy {
        let _ = destination;
        DestinationPolicy::default()
    }

    /// Extra cookie appended to the `Cookie` header for this destination,
    /// e.g. an access token obtained out of band.
    fn extra_cookie(&self, destination: &str) -> Option<(String, String)> {
        let _ = destination;
        None
    }
}

/// Resolver with a fixed policy table, for applications with a static set of
/// configured destinations.
#[derive(Default)]
pub struct StaticResolver {
    policies: HashMap<String, DestinationPolicy>,
    cookies: HashMap<String, (String, String)>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, destination: impl Into<String>, policy: DestinationPolicy) -> Self {
        self.policies.insert(destination.into(), policy);
        self
    }

    pub fn with_cookie(
        mut self,
        destination: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.cookies
            .insert(destination.into(), (name.into(), value.into()));
        self
    }
}

impl DestinationResolver for StaticResolver {
    fn policy(&self, destination: &str) -> DestinationPolicy {
        self.policies.get(destination).cloned().unwrap_or_default()
    }

    fn extra_cookie(&self, destination: &str) -> Option<(String, String)> {
        self.cookies.get(destination).cloned()
    }
}

/// Outcome of an interstitial-challenge inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Not a challenge page; proceed with the response as-is.
    None,
    /// The challenge was solved out of band; retry the same request.
    Solved,
}

/// Inspects a response for a destination-specific interstitial challenge
/// (e.g. an anti-bot page) and may signal that it was just solved, in which
/// case the engine retries the request against the attempt budget.
pub trait ChallengeChecker: Send + Sync {
    fn check(&self, destination: &str, head: &ResponseHead) -> ChallengeOutcome;
}

/// Checker that never reports a challenge.
pub(crate) struct NoChallenge;

impl ChallengeChecker for NoChallenge {
    fn check(&self, _destination: &str, _head: &ResponseHead) -> ChallengeOutcome {
        ChallengeOutcome::None
    }
}

pub(crate) type SharedResolver = Arc<dyn DestinationResolver>;
pub(crate) type SharedChallengeChecker = Arc<dyn ChallengeChecker>;

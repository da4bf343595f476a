//! Access control rule engine.
//!
//! Flow Overview:
//! 1) Rules are compiled once from configuration; any malformed criterion
//!    aborts construction so an inconsistent engine never serves traffic.
//! 2) Each request is evaluated top to bottom against the compiled rules.
//! 3) The first rule whose criteria all match decides the policy; when none
//!    matches, the default policy applies.
//!
//! The compiled engine is immutable and shared behind an `Arc`, so evaluation
//! needs no locking.

mod rule;

pub use rule::{DomainList, DomainPattern, Rule, RuleConfig, SubjectCriterion};

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::{fmt, net::IpAddr};
use thiserror::Error;
use tracing::trace;
use utoipa::ToSchema;

/// Required trust level for a request.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    Bypass,
    OneFactor,
    TwoFactor,
    Deny,
}

impl PolicyLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::OneFactor => "one_factor",
            Self::TwoFactor => "two_factor",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated identity of the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub username: String,
    pub groups: Vec<String>,
}

impl Subject {
    #[must_use]
    pub fn new(username: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            username: username.into(),
            groups,
        }
    }

    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// The protected resource being requested.
#[derive(Clone, Debug)]
pub struct Target {
    domain: String,
    path: String,
    method: Method,
    ip: IpAddr,
}

impl Target {
    /// The domain is lowercased and IPv4-mapped IPv6 addresses are unwrapped
    /// so rules written with IPv4 networks still apply.
    #[must_use]
    pub fn new(domain: &str, path: &str, method: Method, ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 @ IpAddr::V4(_) => v4,
        };

        Self {
            domain: domain.trim().to_ascii_lowercase(),
            path: path.to_string(),
            method,
            ip,
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("access control requires at least one rule")]
    NoRules,
    #[error("rule {index}: at least one domain is required")]
    MissingDomain { index: usize },
    #[error("rule {index}: invalid domain pattern '{pattern}'")]
    InvalidDomain { index: usize, pattern: String },
    #[error("rule {index}: invalid resource pattern '{pattern}': {source}")]
    InvalidResource {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule {index}: invalid subject '{subject}', expected 'user:<name>' or 'group:<name>'")]
    InvalidSubject { index: usize, subject: String },
    #[error("rule {index}: invalid network '{network}': {source}")]
    InvalidNetwork {
        index: usize,
        network: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },
    #[error("rule {index}: unsupported method '{method}'")]
    InvalidMethod { index: usize, method: String },
}

fn default_policy() -> PolicyLevel {
    PolicyLevel::Deny
}

/// `[access_control]` section of the configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessControlConfig {
    #[serde(default = "default_policy")]
    pub default_policy: PolicyLevel,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Compiled, immutable rule set.
#[derive(Debug)]
pub struct AccessControl {
    rules: Vec<Rule>,
    default_policy: PolicyLevel,
}

impl AccessControl {
    /// Compile the configured rules, preserving their order.
    ///
    /// # Errors
    /// Returns the first `RuleError` found; no partial rule set is ever built.
    pub fn new(config: &AccessControlConfig) -> Result<Self, RuleError> {
        if config.rules.is_empty() {
            return Err(RuleError::NoRules);
        }

        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| Rule::compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            default_policy: config.default_policy,
        })
    }

    /// First matching rule wins; otherwise the default policy.
    #[must_use]
    pub fn evaluate(&self, subject: Option<&Subject>, target: &Target) -> PolicyLevel {
        match self
            .rules
            .iter()
            .position(|rule| rule.matches(subject, target))
        {
            Some(index) => {
                let policy = self.rules[index].policy();
                trace!(
                    rule = index,
                    policy = %policy,
                    domain = target.domain(),
                    path = target.path(),
                    "access control rule matched"
                );
                policy
            }
            None => {
                trace!(
                    policy = %self.default_policy,
                    domain = target.domain(),
                    path = target.path(),
                    "no access control rule matched, applying default policy"
                );
                self.default_policy
            }
        }
    }

    #[must_use]
    pub fn default_policy(&self) -> PolicyLevel {
        self.default_policy
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

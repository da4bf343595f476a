//! Rule configuration and compiled rule criteria.

use axum::http::Method;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;

use super::{PolicyLevel, RuleError, Subject, Target};

const SUPPORTED_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

/// A rule as written in the configuration file, before validation.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub domain: DomainList,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub policy: PolicyLevel,
}

impl RuleConfig {
    /// Rule matching every request to `domain` with the given policy.
    #[must_use]
    pub fn new(domain: &str, policy: PolicyLevel) -> Self {
        Self {
            domain: DomainList::One(domain.to_string()),
            resources: Vec::new(),
            subject: None,
            networks: Vec::new(),
            methods: Vec::new(),
            policy,
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: &[&str]) -> Self {
        self.resources = resources.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    #[must_use]
    pub fn with_networks(mut self, networks: &[&str]) -> Self {
        self.networks = networks.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(ToString::to_string).collect();
        self
    }
}

/// `domain = "a.example.com"` or `domain = ["a.example.com", "*.example.com"]`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum DomainList {
    One(String),
    Many(Vec<String>),
}

impl DomainList {
    fn as_slice(&self) -> &[String] {
        match self {
            Self::One(domain) => std::slice::from_ref(domain),
            Self::Many(domains) => domains,
        }
    }
}

/// Exact host or `*.suffix` wildcard. Stored lowercased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    /// Suffix including the leading dot, e.g. `.example.com`.
    Wildcard(String),
}

impl DomainPattern {
    /// Parse a configured domain pattern.
    ///
    /// Returns `None` for empty patterns, misplaced wildcards or characters
    /// that cannot appear in a host name.
    #[must_use]
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();

        if let Some(suffix) = pattern.strip_prefix("*.") {
            return valid_host(suffix).then(|| Self::Wildcard(format!(".{suffix}")));
        }

        valid_host(&pattern).then_some(Self::Exact(pattern))
    }

    /// `host` must already be lowercased.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(domain) => host == domain,
            Self::Wildcard(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

fn valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Who a rule applies to. Rules without a subject, or with `subject = "any"`,
/// apply to everyone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubjectCriterion {
    User(String),
    Group(String),
}

impl SubjectCriterion {
    #[must_use]
    pub fn parse(subject: &str) -> Option<Self> {
        let subject = subject.trim();
        let (kind, name) = subject.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        match kind.trim() {
            "user" => Some(Self::User(name.to_string())),
            "group" => Some(Self::Group(name.to_string())),
            _ => None,
        }
    }

    /// Anonymous callers never satisfy a user or group criterion.
    #[must_use]
    pub fn matches(&self, subject: Option<&Subject>) -> bool {
        let Some(subject) = subject else {
            return false;
        };

        match self {
            Self::User(name) => subject.username == *name,
            Self::Group(group) => subject.in_group(group),
        }
    }
}

/// A validated rule. Every present criterion must match for the rule to apply.
#[derive(Clone, Debug)]
pub struct Rule {
    domains: Vec<DomainPattern>,
    resources: Vec<Regex>,
    subject: Option<SubjectCriterion>,
    networks: Vec<IpNetwork>,
    methods: Vec<Method>,
    policy: PolicyLevel,
}

impl Rule {
    /// Compile a configured rule; `index` is only used for error reporting.
    ///
    /// # Errors
    /// Returns a `RuleError` naming the first invalid criterion.
    pub fn compile(index: usize, config: &RuleConfig) -> Result<Self, RuleError> {
        let domains = config
            .domain
            .as_slice()
            .iter()
            .map(|pattern| {
                DomainPattern::parse(pattern).ok_or_else(|| RuleError::InvalidDomain {
                    index,
                    pattern: pattern.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if domains.is_empty() {
            return Err(RuleError::MissingDomain { index });
        }

        let resources = config
            .resources
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| RuleError::InvalidResource {
                    index,
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let subject = config
            .subject
            .as_deref()
            .filter(|subject| !subject.trim().eq_ignore_ascii_case("any"))
            .map(|subject| {
                SubjectCriterion::parse(subject).ok_or_else(|| RuleError::InvalidSubject {
                    index,
                    subject: subject.to_string(),
                })
            })
            .transpose()?;

        let networks = config
            .networks
            .iter()
            .map(|network| {
                network
                    .trim()
                    .parse::<IpNetwork>()
                    .map_err(|source| RuleError::InvalidNetwork {
                        index,
                        network: network.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let methods = config
            .methods
            .iter()
            .map(|method| {
                let upper = method.trim().to_ascii_uppercase();
                SUPPORTED_METHODS
                    .iter()
                    .find(|supported| supported.as_str() == upper)
                    .cloned()
                    .ok_or_else(|| RuleError::InvalidMethod {
                        index,
                        method: method.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            domains,
            resources,
            subject,
            networks,
            methods,
            policy: config.policy,
        })
    }

    #[must_use]
    pub fn policy(&self) -> PolicyLevel {
        self.policy
    }

    #[must_use]
    pub fn matches(&self, subject: Option<&Subject>, target: &Target) -> bool {
        self.domains
            .iter()
            .any(|domain| domain.matches(target.domain()))
            && (self.resources.is_empty()
                || self
                    .resources
                    .iter()
                    .any(|resource| resource.is_match(target.path())))
            && self
                .subject
                .as_ref()
                .map_or(true, |criterion| criterion.matches(subject))
            && (self.networks.is_empty()
                || self
                    .networks
                    .iter()
                    .any(|network| network.contains(target.ip())))
            && (self.methods.is_empty() || self.methods.contains(target.method()))
    }
}

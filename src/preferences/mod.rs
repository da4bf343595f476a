//! Second-factor preferences of a user.

mod aggregator;

pub use aggregator::{AggregationError, Lookup, PreferenceAggregator};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

/// Supported second-factor methods. Stored and transmitted in snake case.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// First supported method, reported when the user never chose one.
    #[default]
    Totp,
    U2f,
    MobilePush,
}

impl Method {
    pub const ALL: [Self; 3] = [Self::Totp, Self::U2f, Self::MobilePush];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::U2f => "u2f",
            Self::MobilePush => "mobile_push",
        }
    }

    fn supported() -> String {
        Self::ALL
            .iter()
            .map(|method| method.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Unknown method '{0}', it should be one of {}", Method::supported())]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| UnknownMethod(value.to_string()))
    }
}

/// Aggregated second-factor view of a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserPreferences {
    pub method: Method,
    pub has_totp: bool,
    pub has_u2f: bool,
}

//! # Vigil (Forward Authentication Authority)
//!
//! `vigil` sits in front of a reverse proxy and answers, for every inbound
//! request, whether the caller may proceed and at which trust level.
//!
//! ## Access Control
//!
//! An ordered rule list maps the request's domain, path, method, network and
//! the caller's identity to a [`access_control::PolicyLevel`]. The first rule
//! whose criteria all match wins; rule order in the configuration is
//! significant. Malformed rules abort startup.
//!
//! ## Regulation
//!
//! Failed first-factor logins are recorded per username. A run of
//! `max_retries` consecutive failures within `find_time` bans the username for
//! `ban_time`. Bans are derived from the attempt history on every check; no
//! unban record is ever written. Login checks for the same username are
//! serialized so parallel guesses cannot slip past the threshold.
//!
//! ## User Preferences
//!
//! The user-info endpoint aggregates the preferred second factor, U2F device
//! presence and TOTP secret presence with three concurrent lookups. Missing
//! data is not an error; backend failures are collected and reported as a
//! generic failure to the client.

pub mod access_control;
pub mod api;
pub mod cli;
pub mod config;
pub mod preferences;
pub mod regulation;
pub mod storage;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}

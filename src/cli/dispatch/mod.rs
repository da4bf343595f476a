//! Map validated CLI matches to the action the binary executes.

use crate::cli::actions::{hash_password, server, Action};
use crate::cli::commands::{ARG_CONFIG, ARG_PASSWORD, ARG_PORT, CMD_HASH_PASSWORD};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::path::PathBuf;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    if let Some(sub) = matches.subcommand_matches(CMD_HASH_PASSWORD) {
        let password = sub
            .get_one::<String>(ARG_PASSWORD)
            .cloned()
            .context("missing required argument: <password>")?;
        return Ok(Action::HashPassword(hash_password::Args {
            password: SecretString::from(password),
        }));
    }

    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let config = matches
        .get_one::<String>(ARG_CONFIG)
        .map(PathBuf::from)
        .context("missing required argument: --config")?;

    Ok(Action::Server(server::Args { port, config }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn config_is_required_for_server() {
        temp_env::with_vars([("VIGIL_CONFIG", None::<&str>)], || {
            let matches = commands::new().get_matches_from(vec!["vigil"]);
            let result = handler(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err
                    .to_string()
                    .contains("missing required argument: --config"));
            }
        });
    }

    #[test]
    fn server_action() {
        temp_env::with_vars(
            [
                ("VIGIL_CONFIG", Some("/etc/vigil/config.toml")),
                ("VIGIL_PORT", Some("9091")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["vigil"]);
                match handler(&matches) {
                    Ok(Action::Server(args)) => {
                        assert_eq!(args.port, 9091);
                        assert_eq!(args.config, PathBuf::from("/etc/vigil/config.toml"));
                    }
                    other => panic!("unexpected action: {other:?}"),
                }
            },
        );
    }

    #[test]
    fn hash_password_action_needs_no_config() {
        temp_env::with_vars([("VIGIL_CONFIG", None::<&str>)], || {
            let matches =
                commands::new().get_matches_from(vec!["vigil", "hash-password", "s3cret"]);
            assert!(matches!(handler(&matches), Ok(Action::HashPassword(_))));
        });
    }
}

use crate::users::hash_password;
use anyhow::{Context, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Args {
    pub password: SecretString,
}

/// Print the PHC string to paste into the `password` field of a user entry.
/// # Errors
/// Returns an error if hashing fails.
pub fn execute(args: &Args) -> Result<()> {
    let hash = hash_password(&args.password).context("Failed to hash password")?;
    println!("{hash}");
    Ok(())
}

use std::{env::current_dir, path::PathBuf};

use rand::{distributions::Alphanumeric, Rng};

use crate::PKG_NAME;

/// Where per-agent databases live by default: the platform data directory,
/// or the working directory on platforms that don't report one.
pub fn data_dir() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| {
        eprintln!("no platform data directory; keeping agent databases under the working directory");
        current_dir().unwrap_or_else(|_| PathBuf::from("."))
    });
    base.join(PKG_NAME)
}

/// Random alphanumeric token, used for schedule/queue ids, connection ids,
/// and MCP server ids
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_requested_length() {
        assert_eq!(random_token(8).len(), 8);
        assert_ne!(random_token(16), random_token(16));
    }

    #[test]
    fn data_dir_ends_with_the_package_name() {
        assert!(data_dir().ends_with(PKG_NAME));
    }
}

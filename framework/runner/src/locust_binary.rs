use std::env;
use std::path::PathBuf;

use swarm_core::prelude::{ClusterConfig, SwarmError, SwarmResult};

/// Environment variable to override the path to the load generator executable.
pub const SWARM_LOCUST_PATH_ENV: &str = "SWARM_LOCUST_PATH";

/// Get the path to the load generator executable.
///
/// If [SWARM_LOCUST_PATH_ENV] is set, its value is used as the path. Otherwise the configured
/// `locust_binary` is looked up in the user's `PATH`.
pub fn locust_path(config: &ClusterConfig) -> SwarmResult<PathBuf> {
    let override_path = env::var(SWARM_LOCUST_PATH_ENV).ok();
    resolve(override_path.as_deref(), &config.locust_binary, env::var_os("PATH"))
}

fn resolve(
    override_path: Option<&str>,
    binary: &str,
    search_path: Option<std::ffi::OsString>,
) -> SwarmResult<PathBuf> {
    match override_path {
        Some("") => Err(not_found(
            binary,
            format!("'{SWARM_LOCUST_PATH_ENV}' set to empty string"),
        )),
        Some(path) => {
            let locust_path = PathBuf::from(path);
            if !locust_path.exists() {
                return Err(not_found(
                    binary,
                    format!(
                        "Path overwritten with '{SWARM_LOCUST_PATH_ENV}={path}' but that path doesn't exist"
                    ),
                ));
            }
            Ok(locust_path)
        }
        None => {
            log::debug!("'{SWARM_LOCUST_PATH_ENV}' is not set so looking for '{binary}' in 'PATH'");
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            which::which_in(binary, search_path, cwd).map_err(|_| {
                not_found(
                    binary,
                    format!(
                        "'{binary}' not found in PATH. Please install Locust or set '{SWARM_LOCUST_PATH_ENV}' to the correct path."
                    ),
                )
            })
        }
    }
}

fn not_found(binary: &str, reason: String) -> SwarmError {
    SwarmError::launch(binary, reason)
}

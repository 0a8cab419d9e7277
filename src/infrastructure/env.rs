//! `.env` loading. Looks in the user's config
//! directory first (`~/Library/Application Support/<app>/.env` on macOS,
//! `~/.config/<app>/.env` on Linux, `%APPDATA%\<app>\.env` on Windows), falls
//! back to `dotenvy::dotenv()` (process cwd), and finally to whatever is
//! already set in the process environment. Direct `cfg(target_os)`
//! branching matches how broker config already reads `std::env` directly,
//! rather than pulling in a platform-dirs crate for one call site.

use std::path::PathBuf;

const APP_NAME: &str = "strategy-engine";

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join(APP_NAME)
        })
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            Some(PathBuf::from(xdg).join(APP_NAME))
        } else {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join(APP_NAME))
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|appdata| PathBuf::from(appdata).join(APP_NAME))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

/// Loads environment variables for the process. Never fails: a missing or
/// unreadable `.env` file just means config falls through to whatever is
/// already in the process environment.
pub fn load_dotenv() {
    if let Some(dir) = config_dir() {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            match dotenvy::from_path(&candidate) {
                Ok(()) => {
                    tracing::debug!(path = %candidate.display(), "loaded .env from config directory");
                    return;
                }
                Err(err) => tracing::warn!(path = %candidate.display(), error = %err, "failed to load config-directory .env"),
            }
        }
    }

    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env from process cwd"),
        Err(_) => tracing::debug!("no .env file found; relying on process environment"),
    }
}

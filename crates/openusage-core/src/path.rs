use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Config(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

const STATE_SUBDIR: &str = "openusage";

/// Resolve the telemetry state directory based on priority:
/// 1. Explicit path (with tilde expansion)
/// 2. XDG_STATE_HOME environment variable
/// 3. System state directory
/// 4. ~/.local/state (fallback for systems without a standard state directory)
pub fn resolve_state_dir(explicit_path: Option<&str>) -> Result<PathBuf> {
    // Priority 1: Explicit path
    if let Some(path) = explicit_path {
        return Ok(expand_tilde(path));
    }

    // Priority 2: XDG_STATE_HOME environment variable
    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME")
        && !xdg_state.trim().is_empty()
    {
        return Ok(expand_tilde(&xdg_state).join(STATE_SUBDIR));
    }

    // Priority 3: System state directory
    if let Some(state_dir) = dirs::state_dir() {
        return Ok(state_dir.join(STATE_SUBDIR));
    }

    // Priority 4: Fallback to ~/.local/state
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home)
            .join(".local")
            .join("state")
            .join(STATE_SUBDIR));
    }

    Err(Error::Config(
        "Could not determine state directory: no HOME or XDG state directory found".to_string(),
    ))
}

/// Expand tilde (~) in paths to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

/// Telemetry database inside a state directory.
pub fn database_path(state_dir: &Path) -> PathBuf {
    state_dir.join("telemetry.db")
}

/// Durable spool directory inside a state directory.
pub fn spool_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("telemetry-spool")
}

use std::path::PathBuf;

/// Resolve the agent home directory.
///
/// Priority:
/// 1) LOGAGENT_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.logagent
pub fn logagent_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("LOGAGENT_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".logagent");
    }
    PathBuf::from(".").join(".logagent")
}

/// Default logs directory: ~/.logagent/logs
pub fn default_logs_dir() -> PathBuf {
    logagent_home().join("logs")
}

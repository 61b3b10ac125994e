//
// config.rs
//
// Configuration for connected-mode binding
//

use std::time::Duration;

/// Connected-mode configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingConfig {
    /// Upper bound on waiting for the editor to answer an SCM-ignore query
    pub scm_ignore_timeout: Duration,
    /// Maximum number of local files considered when computing path prefixes
    pub path_scan_max_files: usize,
    /// Maximum directory depth walked when computing path prefixes
    pub path_scan_max_depth: usize,
    /// Whether connection-scoped failures are shown to the user
    pub notify_binding_failures: bool,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            scm_ignore_timeout: Duration::from_secs(60),
            path_scan_max_files: 10_000,
            path_scan_max_depth: 32,
            notify_binding_failures: true,
        }
    }
}

/// Parse the `connectedMode` section of initialization options.
///
/// Returns `None` when the section is absent; missing keys keep their defaults.
pub fn parse_binding_config(settings: &serde_json::Value) -> Option<BindingConfig> {
    let connected_mode = settings.get("connectedMode")?;
    let mut config = BindingConfig::default();

    if let Some(v) = connected_mode
        .get("scmIgnoreTimeoutSecs")
        .and_then(|v| v.as_u64())
    {
        config.scm_ignore_timeout = Duration::from_secs(v);
    }
    if let Some(path_scan) = connected_mode.get("pathScan") {
        if let Some(v) = path_scan.get("maxFiles").and_then(|v| v.as_u64()) {
            config.path_scan_max_files = v as usize;
        }
        if let Some(v) = path_scan.get("maxDepth").and_then(|v| v.as_u64()) {
            config.path_scan_max_depth = v as usize;
        }
    }
    if let Some(v) = connected_mode
        .get("notifyBindingFailures")
        .and_then(|v| v.as_bool())
    {
        config.notify_binding_failures = v;
    }

    log::info!("Connected mode configuration:");
    log::info!("  scmIgnoreTimeout: {:?}", config.scm_ignore_timeout);
    log::info!("  pathScan.maxFiles: {}", config.path_scan_max_files);
    log::info!("  pathScan.maxDepth: {}", config.path_scan_max_depth);
    log::info!("  notifyBindingFailures: {}", config.notify_binding_failures);

    Some(config)
}

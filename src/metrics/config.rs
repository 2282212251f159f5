/// Configuration for the Prometheus exporter and HTTP instrumentation

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable HTTP instrumentation and the export endpoint
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Endpoint path for metrics export
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Paths excluded from HTTP metrics
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// How often queue depth and uptime are sampled
    #[serde(default = "default_sample_interval")]
    pub queue_sample_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            excluded_paths: default_excluded_paths(),
            queue_sample_interval_secs: default_sample_interval(),
        }
    }
}

impl MetricsConfig {
    /// Create a configuration with metrics disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Check if a path should be excluded from metrics
    pub fn is_path_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|excluded| {
            if let Some(prefix) = excluded.strip_suffix('*') {
                path.starts_with(prefix)
            } else {
                path == excluded
            }
        })
    }
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "/metrics".to_string()
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_sample_interval() -> u64 {
    15
}

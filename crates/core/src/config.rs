use serde::{Deserialize, Serialize};

/// Database connection settings shared by every component that persists state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Pools older than this are proactively rebuilt to avoid operating on a
    /// silently dead handle.
    pub max_connection_age_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/perp_engine".to_string(),
            max_connections: 10,
            max_connection_age_secs: 30 * 60,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory to store cached files. Platform default when unset.
    pub cache_directory: Option<PathBuf>,

    /// Timeout for origin requests in seconds
    pub request_timeout_secs: u64,

    /// Enable hit/miss/progress stats reporting
    pub enable_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            request_timeout_secs: 300, // 5 minutes
            enable_stats: true,
        }
    }
}

impl CacheConfig {
    /// Get the cache directory path, using platform-specific defaults if not set
    pub fn cache_directory(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_directory {
            Ok(dir.clone())
        } else {
            Self::default_cache_directory()
        }
    }

    /// Get platform-specific default cache directory
    pub fn default_cache_directory() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().ok_or_else(|| {
            CacheError::Configuration("Failed to resolve platform cache directory".to_string())
        })?;
        Ok(cache_dir.join("spancache").join("media"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(CacheError::Configuration(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

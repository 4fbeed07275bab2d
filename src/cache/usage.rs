//! Cache footprint reporting

use serde::Serialize;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSizeStatus {
    /// Under 80% of limit
    Ok,
    /// Between 80% and 100% of limit
    Warning,
    /// Over the limit
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size and limit
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        if limit_bytes == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current_bytes, limit_bytes);
        if current_bytes > limit_bytes {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

/// Snapshot of what a cache location holds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheUsage {
    /// Number of entries (full files and chunks)
    pub entries: usize,
    /// Bytes held by entries
    pub total_bytes: u64,
    /// Configured limit
    pub limit_bytes: u64,
}

impl CacheUsage {
    /// Status of the footprint against the limit
    pub fn status(&self) -> CacheSizeStatus {
        CacheSizeStatus::from_usage(self.total_bytes, self.limit_bytes)
    }

    /// Percentage of the limit in use
    pub fn percentage(&self) -> f64 {
        CacheSizeStatus::percentage(self.total_bytes, self.limit_bytes)
    }
}

//! Download progress tracking

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Progress of one streamed download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Track uid or asset key
    pub uid: String,

    /// Declared size, when the server sent one
    pub total_bytes: Option<u64>,

    /// Bytes received so far
    pub downloaded_bytes: u64,

    /// Progress percentage (0-100), 0 while the size is unknown
    pub progress_percent: u8,

    /// Current download speed in bytes/second
    pub speed_bytes_per_sec: u64,

    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,

    #[serde(skip, default = "Instant::now")]
    started: Instant,
}

impl DownloadProgress {
    /// Create new download progress tracker.
    pub fn new(uid: impl Into<String>, total_bytes: Option<u64>) -> Self {
        Self {
            uid: uid.into(),
            total_bytes,
            downloaded_bytes: 0,
            progress_percent: 0,
            speed_bytes_per_sec: 0,
            eta_seconds: None,
            started: Instant::now(),
        }
    }

    /// Update progress with the running byte count.
    pub fn update(&mut self, downloaded_bytes: u64) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.downloaded_bytes = downloaded_bytes;

        if let Some(total) = self.total_bytes.filter(|t| *t > 0) {
            let percent = (downloaded_bytes as f64 / total as f64) * 100.0;
            self.progress_percent = percent.min(100.0) as u8;
        }

        if elapsed > 0.0 {
            self.speed_bytes_per_sec = (downloaded_bytes as f64 / elapsed) as u64;
        }

        self.eta_seconds = match self.total_bytes {
            Some(total) if self.speed_bytes_per_sec > 0 => {
                Some(total.saturating_sub(downloaded_bytes) / self.speed_bytes_per_sec)
            }
            _ => None,
        };
    }

    /// Returns true once every declared byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.downloaded_bytes >= total)
    }

    /// Milliseconds since the tracker was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Format speed as human-readable string.
    pub fn speed_string(&self) -> String {
        format_bytes_per_sec(self.speed_bytes_per_sec)
    }

    /// Format ETA as human-readable string.
    pub fn eta_string(&self) -> String {
        match self.eta_seconds {
            Some(secs) => format_duration_seconds(secs),
            None => "calculating...".to_string(),
        }
    }
}

/// Format bytes per second as human-readable string.
fn format_bytes_per_sec(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B/s", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB/s", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB/s", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB/s", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format duration in seconds as human-readable string.
fn format_duration_seconds(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_progress() {
        let mut progress = DownloadProgress::new("track123", Some(10_000_000));

        assert_eq!(progress.progress_percent, 0);
        assert!(!progress.is_complete());

        std::thread::sleep(std::time::Duration::from_millis(20));
        progress.update(5_000_000);

        assert_eq!(progress.progress_percent, 50);
        assert!(progress.speed_bytes_per_sec > 0);
        assert!(progress.eta_seconds.is_some());
        assert!(!progress.is_complete());

        progress.update(10_000_000);
        assert_eq!(progress.progress_percent, 100);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_unknown_length() {
        let mut progress = DownloadProgress::new("track123", None);
        progress.update(4096);

        assert_eq!(progress.progress_percent, 0);
        assert_eq!(progress.eta_seconds, None);
        assert_eq!(progress.eta_string(), "calculating...");
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes_per_sec(500), "500 B/s");
        assert_eq!(format_bytes_per_sec(1024), "1.0 KB/s");
        assert_eq!(format_bytes_per_sec(1024 * 1024), "1.0 MB/s");
        assert_eq!(format_bytes_per_sec(1024 * 1024 * 1024), "1.0 GB/s");

        assert_eq!(format_duration_seconds(30), "30s");
        assert_eq!(format_duration_seconds(90), "1m 30s");
        assert_eq!(format_duration_seconds(3661), "1h 1m");
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::models::{ArtifactKind, FileSizes};

/// Default sampling period while a job is running.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Format a byte count with base-1024 units, two decimals at most.
///
/// Picks the largest unit whose scaled value is at least 1 and drops
/// trailing fractional zeros: `1536` -> `"1.5 KB"`, `1024` -> `"1 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut unit = 0;
    let mut divisor: u64 = 1;
    while unit + 1 < UNITS.len() && bytes / divisor >= 1024 {
        divisor *= 1024;
        unit += 1;
    }

    let scaled = bytes as f64 / divisor as f64;
    let fixed = format!("{:.2}", scaled);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// Read the current size of every artifact in `artifact_dir`.
///
/// A missing file reports `"0 B"`. Any other read failure is logged and
/// also reported as `"0 B"`; sampling never fails as a whole.
pub async fn sample_sizes(artifact_dir: &Path) -> FileSizes {
    let mut sizes = FileSizes::default();
    for kind in ArtifactKind::ALL {
        let path = artifact_dir.join(kind.file_name());
        match tokio::fs::metadata(&path).await {
            Ok(meta) => sizes.set(kind, format_bytes(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), path = %path.display(), error = %e, "Failed to read artifact size");
            }
        }
    }
    sizes
}

/// Periodically samples artifact sizes while a run is active.
#[derive(Debug, Clone)]
pub struct FileSizePoller {
    artifact_dir: PathBuf,
    interval: Duration,
}

impl FileSizePoller {
    pub fn new(artifact_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start sampling until `cancel` fires.
    ///
    /// Samples arrive on the returned channel. The channel holds one sample;
    /// when the consumer falls behind, newer samples are dropped rather than
    /// queued, so a slow consumer never accumulates stale sizes.
    pub fn spawn(&self, cancel: CancellationToken) -> mpsc::Receiver<FileSizes> {
        let (tx, rx) = mpsc::channel(1);
        let artifact_dir = self.artifact_dir.clone();
        let period = self.interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; the first sample is due one period in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sizes = sample_sizes(&artifact_dir).await;
                        if cancel.is_cancelled() {
                            break;
                        }
                        match tx.try_send(sizes) {
                            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            tracing::debug!("File-size poller stopped");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_zero() {
        assert_eq!(format_bytes(0), "0 B");
    }

    #[test]
    fn test_format_bytes_exact_units() {
        assert_eq!(format_bytes(1), "1 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1_048_576), "1 MB");
        assert_eq!(format_bytes(1 << 30), "1 GB");
    }

    #[test]
    fn test_format_bytes_fractional() {
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1300), "1.27 KB");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn test_format_bytes_largest_unit() {
        assert_eq!(format_bytes(u64::MAX), "16 EB");
    }

    #[tokio::test]
    async fn test_sample_sizes_missing_files_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = sample_sizes(dir.path()).await;
        assert_eq!(sizes, FileSizes::default());
    }

    #[tokio::test]
    async fn test_sample_sizes_reads_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), vec![b'a'; 1536]).unwrap();
        std::fs::write(dir.path().join("output.md"), b"# hi\n").unwrap();

        let sizes = sample_sizes(dir.path()).await;
        assert_eq!(sizes.txt, "1.5 KB");
        assert_eq!(sizes.md, "5 B");
        assert_eq!(sizes.pdf, "0 B");
    }

    #[tokio::test]
    async fn test_poller_emits_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), b"abc").unwrap();

        let poller = FileSizePoller::new(dir.path(), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let mut rx = poller.spawn(cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("poller should emit a sample")
            .expect("channel open");
        assert_eq!(first.txt, "3 B");

        cancel.cancel();
        // The task drops its sender once it observes cancellation.
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "poller should stop after cancellation");
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(DEFAULT_POLL_INTERVAL, Duration::from_millis(500));
    }
}

use std::time::Duration;
use tracing::info;

/// Throughput and loss figures for one op of a run
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub total_time: Option<Duration>,
    pub batch_times: Vec<Duration>,
    pub batches: u64,
    pub samples: u64,
    pub bytes_loaded: u64,
    pub losses: Vec<f32>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_total_time(&mut self, duration: Duration) {
        self.total_time = Some(duration);
    }

    /// One batch pulled from a loader: how long the wait was and how big it was.
    pub fn record_batch(&mut self, wait: Duration, samples: usize, bytes: usize) {
        self.batch_times.push(wait);
        self.batches += 1;
        self.samples += samples as u64;
        self.bytes_loaded += bytes as u64;
    }

    pub fn record_loss(&mut self, loss: f32) {
        self.losses.push(loss);
    }

    pub fn average_batch_time(&self) -> Option<Duration> {
        if self.batch_times.is_empty() {
            return None;
        }
        let total: Duration = self.batch_times.iter().sum();
        Some(total / self.batch_times.len() as u32)
    }

    pub fn mean_loss(&self) -> Option<f32> {
        if self.losses.is_empty() {
            return None;
        }
        Some(self.losses.iter().sum::<f32>() / self.losses.len() as f32)
    }

    /// Mean of the losses recorded after the first `skip`.
    pub fn mean_loss_since(&self, skip: usize) -> Option<f32> {
        let tail = self.losses.get(skip..)?;
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().sum::<f32>() / tail.len() as f32)
    }

    pub fn samples_per_sec(&self) -> Option<f64> {
        let seconds = self.total_time?.as_secs_f64();
        if seconds > 0.0 {
            Some(self.samples as f64 / seconds)
        } else {
            None
        }
    }

    pub fn throughput_mbps(&self) -> Option<f64> {
        let seconds = self.total_time?.as_secs_f64();
        if seconds > 0.0 {
            Some((self.bytes_loaded as f64) / (1024.0 * 1024.0) / seconds)
        } else {
            None
        }
    }

    pub fn log_summary(&self, label: &str) {
        info!(
            "{}: {} batches, {} samples, {:.2} MB in {:?} (mean loss {:?})",
            label,
            self.batches,
            self.samples,
            self.bytes_loaded as f64 / (1024.0 * 1024.0),
            self.total_time.unwrap_or_default(),
            self.mean_loss()
        );
    }

    pub fn print_summary(&self, label: &str) {
        println!("\n=== {} ===", label);

        if let Some(total_time) = self.total_time {
            println!("Total Time: {:?}", total_time);
        }

        println!("Batches: {}", self.batches);
        println!("Samples: {}", self.samples);

        // Use KB for smaller values, MB for larger ones
        if self.bytes_loaded < 1024 * 1024 {
            println!("Bytes Loaded: {:.2} KB", self.bytes_loaded as f64 / 1024.0);
        } else {
            println!("Bytes Loaded: {:.2} MB", self.bytes_loaded as f64 / (1024.0 * 1024.0));
        }

        if let Some(avg) = self.average_batch_time() {
            println!("Average Batch Wait: {:?}", avg);
        }

        if let Some(rate) = self.samples_per_sec() {
            println!("Samples/sec: {:.1}", rate);
        }

        if let Some(throughput) = self.throughput_mbps() {
            println!("Throughput: {:.2} MB/s", throughput);
        }

        if let Some(loss) = self.mean_loss() {
            println!("Mean Loss: {:.6}", loss);
        }

        println!("=============================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_have_no_rates() {
        let metrics = Metrics::new();
        assert!(metrics.average_batch_time().is_none());
        assert!(metrics.mean_loss().is_none());
        assert!(metrics.samples_per_sec().is_none());
    }

    #[test]
    fn batches_and_losses_accumulate() {
        let mut metrics = Metrics::new();
        metrics.record_batch(Duration::from_millis(10), 4, 1024);
        metrics.record_batch(Duration::from_millis(30), 4, 1024);
        metrics.record_loss(1.0);
        metrics.record_loss(3.0);
        metrics.record_loss(5.0);
        metrics.record_total_time(Duration::from_secs(2));

        assert_eq!(metrics.batches, 2);
        assert_eq!(metrics.samples, 8);
        assert_eq!(metrics.average_batch_time(), Some(Duration::from_millis(20)));
        assert_eq!(metrics.mean_loss(), Some(3.0));
        assert_eq!(metrics.mean_loss_since(1), Some(4.0));
        assert_eq!(metrics.mean_loss_since(3), None);
        assert_eq!(metrics.samples_per_sec(), Some(4.0));
    }
}

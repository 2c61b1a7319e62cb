// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use serde::Serialize;
use std::time::{Duration, Instant};

/// Capture statistics reported at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetrics {
    /// Frames delivered by the engine
    pub frames_captured: u64,
    /// Capture calls that returned no frame
    pub empty_captures: u64,
    /// Times the device had to be brought back after a reconnect
    pub reconnects: u64,
    /// Output bytes delivered
    pub bytes_captured: u64,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Average throughput in frames per second
    pub throughput_fps: f64,
    /// Minimum capture call latency in microseconds
    pub latency_min_us: u64,
    /// Maximum capture call latency in microseconds
    pub latency_max_us: u64,
    /// Average capture call latency in microseconds
    pub latency_avg_us: u64,
    /// 50th percentile (median) latency in microseconds
    pub latency_p50_us: u64,
    /// 95th percentile latency in microseconds
    pub latency_p95_us: u64,
    /// 99th percentile latency in microseconds
    pub latency_p99_us: u64,
    /// Frames missing from the driver timestamp sequence
    pub dropped_frames: u64,
}

/// Collects per-frame latency and timestamp gaps during a capture run
pub struct MetricsCollector {
    start_time: Instant,
    frame_period: f64,
    latencies_us: Vec<u64>,
    bytes: u64,
    empty: u64,
    reconnects: u64,
    prev_timestamp: Option<f64>,
    dropped_frames: u64,
}

impl MetricsCollector {
    /// Create a collector for a stream running at `frame_rate`
    pub fn new(frame_rate: f64) -> Self {
        Self {
            start_time: Instant::now(),
            frame_period: 1.0 / frame_rate,
            latencies_us: Vec::new(),
            bytes: 0,
            empty: 0,
            reconnects: 0,
            prev_timestamp: None,
            dropped_frames: 0,
        }
    }

    /// Record a delivered frame: call latency, payload size and driver timestamp
    pub fn record_frame(&mut self, latency: Duration, bytes: usize, timestamp: f64) {
        self.latencies_us.push(latency.as_micros() as u64);
        self.bytes += bytes as u64;
        self.track_timestamp(timestamp);
    }

    /// Frames recorded so far
    pub fn frames(&self) -> u64 {
        self.latencies_us.len() as u64
    }

    /// Record a capture call that returned no frame
    pub fn record_empty(&mut self) {
        self.empty += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
        // timestamps restart with the new session
        self.prev_timestamp = None;
    }

    /// Count whole frame periods missing between consecutive timestamps
    /// Returns the number of dropped frames detected (0 or N)
    pub fn track_timestamp(&mut self, timestamp: f64) -> u64 {
        let drops = match self.prev_timestamp {
            Some(prev) if timestamp < prev => {
                log::warn!("Frame timestamp went backwards: {:.6} -> {:.6}", prev, timestamp);
                0
            }
            Some(prev) => {
                let periods = ((timestamp - prev) / self.frame_period).round();
                if periods > 1.0 {
                    periods as u64 - 1
                } else {
                    0
                }
            }
            None => 0,
        };

        self.dropped_frames += drops;
        self.prev_timestamp = Some(timestamp);
        drops
    }

    /// Finalize and calculate all metrics
    pub fn finalize(&mut self) -> FrameMetrics {
        let duration = self.start_time.elapsed();
        let duration_secs = duration.as_secs_f64();
        let frames_captured = self.latencies_us.len() as u64;

        let throughput_fps = if duration_secs > 0.0 {
            frames_captured as f64 / duration_secs
        } else {
            0.0
        };

        self.latencies_us.sort_unstable();
        let (min_us, max_us, avg_us) = match (self.latencies_us.first(), self.latencies_us.last())
        {
            (Some(&min), Some(&max)) => {
                let sum: u64 = self.latencies_us.iter().sum();
                (min, max, sum / frames_captured)
            }
            _ => (0, 0, 0),
        };

        FrameMetrics {
            frames_captured,
            empty_captures: self.empty,
            reconnects: self.reconnects,
            bytes_captured: self.bytes,
            duration_ms: duration.as_millis() as u64,
            throughput_fps,
            latency_min_us: min_us,
            latency_max_us: max_us,
            latency_avg_us: avg_us,
            latency_p50_us: self.percentile(50.0),
            latency_p95_us: self.percentile(95.0),
            latency_p99_us: self.percentile(99.0),
            dropped_frames: self.dropped_frames,
        }
    }

    /// Calculate percentile from sorted latency data
    fn percentile(&self, p: f64) -> u64 {
        if self.latencies_us.is_empty() {
            return 0;
        }

        let len = self.latencies_us.len();
        let idx = ((p / 100.0) * (len - 1) as f64).round() as usize;
        self.latencies_us[idx.min(len - 1)]
    }
}

/// Print metrics in human-readable format
pub fn print_text(metrics: &FrameMetrics) {
    println!("\n=== Capture Metrics ===");
    println!("Frames captured:   {}", metrics.frames_captured);
    println!("Empty captures:    {}", metrics.empty_captures);
    println!("Reconnects:        {}", metrics.reconnects);
    println!(
        "Bytes captured:    {} ({:.2} MB)",
        metrics.bytes_captured,
        metrics.bytes_captured as f64 / 1_048_576.0
    );
    println!(
        "Duration:          {:.2} s",
        metrics.duration_ms as f64 / 1000.0
    );
    println!("Throughput:        {:.2} fps", metrics.throughput_fps);

    if metrics.frames_captured > 0 {
        println!("\nCapture Latency (µs):");
        println!("  Min:    {}", metrics.latency_min_us);
        println!("  Max:    {}", metrics.latency_max_us);
        println!("  Avg:    {}", metrics.latency_avg_us);
        println!("  P50:    {}", metrics.latency_p50_us);
        println!("  P95:    {}", metrics.latency_p95_us);
        println!("  P99:    {}", metrics.latency_p99_us);
    }

    if metrics.dropped_frames > 0 {
        let expected = metrics.frames_captured + metrics.dropped_frames;
        println!(
            "\nDropped frames:    {} ({:.2}%)",
            metrics.dropped_frames,
            (metrics.dropped_frames as f64 / expected as f64) * 100.0
        );
    }
}

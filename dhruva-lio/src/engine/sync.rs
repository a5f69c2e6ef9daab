//! Sensor-stream synchronisation.
//!
//! Pairs each LiDAR scan with the IMU samples covering its interval. The
//! two intake callbacks and the driver share exactly one mutex over the
//! buffers; every critical section is a push or a pop.
//!
//! The scan-end time comes from the largest per-point time offset when the
//! scan carries credible timing, otherwise from a running mean of scan
//! durations updated with the single-pass recurrence
//! `mean += (x - mean) / n`.

use std::collections::VecDeque;

use log::warn;
use parking_lot::Mutex;

use crate::core::types::{ImuReading, MeasureBundle, PointCloud3D};

/// Synchroniser options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncConfig {
    /// Apply `time_offset_lidar_to_imu` to incoming IMU timestamps.
    pub time_sync_en: bool,
    /// Constant offset added to IMU timestamps when enabled, seconds.
    pub time_offset_lidar_to_imu: f64,
}

/// A scan whose end time has been estimated but whose IMU window is not
/// complete yet.
struct PendingScan {
    scan: PointCloud3D,
    scan_time: f64,
    scan_end_time: f64,
}

#[derive(Default)]
struct Buffers {
    lidar: VecDeque<(f64, PointCloud3D)>,
    imu: VecDeque<ImuReading>,
    pending: Option<PendingScan>,
    last_lidar_time: f64,
    last_imu_time: f64,
    mean_scan_duration: f64,
    scan_count: u64,
}

/// Thread-safe scan/IMU pairing buffers.
pub struct MeasureSync {
    config: SyncConfig,
    buffers: Mutex<Buffers>,
}

impl MeasureSync {
    /// Create empty buffers.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Intake one decoded scan. A timestamp regression clears the LiDAR
    /// buffer and logs a warning.
    pub fn push_scan(&self, timestamp: f64, scan: PointCloud3D) {
        let mut buffers = self.buffers.lock();
        if timestamp < buffers.last_lidar_time {
            warn!(
                "lidar loop back ({timestamp:.6} < {:.6}), clearing buffer",
                buffers.last_lidar_time
            );
            buffers.lidar.clear();
        }
        buffers.last_lidar_time = timestamp;
        buffers.lidar.push_back((timestamp, scan));
    }

    /// Intake one IMU sample. A timestamp regression clears the IMU buffer
    /// and logs a warning.
    pub fn push_imu(&self, mut sample: ImuReading) {
        if self.config.time_sync_en {
            sample.timestamp += self.config.time_offset_lidar_to_imu;
        }
        let mut buffers = self.buffers.lock();
        if sample.timestamp < buffers.last_imu_time {
            warn!(
                "imu loop back ({:.6} < {:.6}), clearing buffer",
                sample.timestamp, buffers.last_imu_time
            );
            buffers.imu.clear();
        }
        buffers.last_imu_time = sample.timestamp;
        buffers.imu.push_back(sample);
    }

    /// Try to assemble the next bundle.
    ///
    /// Returns `None` until the oldest scan's interval is fully covered by
    /// IMU data. Drains every IMU sample before the scan-end time into the
    /// bundle; the first sample at or past it stays buffered so the next
    /// bundle's first integration interval has a bracket.
    pub fn pull(&self) -> Option<MeasureBundle> {
        let mut buffers = self.buffers.lock();

        if buffers.pending.is_none() {
            let (scan_time, scan) = buffers.lidar.pop_front()?;
            let max_offset = scan.max_time_offset();

            let scan_end_time = if scan.len() <= 1 {
                warn!("scan with {} points, using mean duration", scan.len());
                scan_time + buffers.mean_scan_duration
            } else if max_offset < 0.5 * buffers.mean_scan_duration {
                scan_time + buffers.mean_scan_duration
            } else {
                buffers.scan_count += 1;
                buffers.mean_scan_duration +=
                    (max_offset - buffers.mean_scan_duration) / buffers.scan_count as f64;
                scan_time + max_offset
            };

            buffers.pending = Some(PendingScan {
                scan,
                scan_time,
                scan_end_time,
            });
        }

        let scan_end_time = buffers.pending.as_ref()?.scan_end_time;
        if buffers.imu.is_empty() || buffers.last_imu_time < scan_end_time {
            return None;
        }

        let mut imu = Vec::new();
        while buffers
            .imu
            .front()
            .is_some_and(|s| s.timestamp < scan_end_time)
        {
            if let Some(sample) = buffers.imu.pop_front() {
                imu.push(sample);
            }
        }

        let pending = buffers.pending.take()?;
        Some(MeasureBundle {
            scan: pending.scan,
            scan_time: pending.scan_time,
            scan_end_time: pending.scan_end_time,
            imu,
        })
    }

    /// Drop everything buffered, including the pending scan and the
    /// running duration statistics.
    pub fn clear(&self) {
        let mut buffers = self.buffers.lock();
        *buffers = Buffers::default();
    }
}

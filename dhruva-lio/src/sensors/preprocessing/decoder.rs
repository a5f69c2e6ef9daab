//! Raw-frame decoding per LiDAR sensor family.
//!
//! Sensors differ in where the per-point time lives and what unit it uses.
//! The decoder folds those conventions into the canonical [`PointCloud3D`]
//! with time offsets in seconds since scan start, applying the min-range
//! gate and point decimation on the way.

use nalgebra::Vector3;

use crate::config::LidarType;
use crate::core::types::{Point3D, PointCloud3D};

/// One raw LiDAR return as delivered by the driver adapter.
#[derive(Debug, Clone, Copy)]
pub struct RawPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: f32,
    /// Per-point time in the sensor's native unit and convention.
    pub time: f64,
}

/// A raw frame: a timestamp and the undecoded returns.
#[derive(Debug, Clone, Default)]
pub struct RawScanFrame {
    /// Frame (scan start) timestamp in seconds.
    pub timestamp: f64,
    pub points: Vec<RawPoint>,
}

/// Decoder options.
#[derive(Debug, Clone, Copy)]
pub struct PointDecoderConfig {
    /// Sensor family.
    pub lidar_type: LidarType,
    /// Minimum return range in metres.
    pub blind: f64,
    /// Scale from the sensor's time unit to seconds.
    pub time_scale: f64,
    /// Keep every n-th point.
    pub point_filter_num: usize,
}

impl Default for PointDecoderConfig {
    fn default() -> Self {
        Self {
            lidar_type: LidarType::Avia,
            blind: 0.01,
            time_scale: 1e-3,
            point_filter_num: 2,
        }
    }
}

/// Decodes raw frames into canonical point sequences.
#[derive(Debug, Clone)]
pub struct PointDecoder {
    config: PointDecoderConfig,
}

impl PointDecoder {
    /// Create a decoder.
    pub fn new(config: PointDecoderConfig) -> Self {
        Self { config }
    }

    /// The decoder configuration.
    pub fn config(&self) -> &PointDecoderConfig {
        &self.config
    }

    /// Decode one raw frame.
    pub fn decode(&self, frame: &RawScanFrame) -> PointCloud3D {
        let filter_num = self.config.point_filter_num.max(1);
        let blind_sq = self.config.blind * self.config.blind;

        // Velodyne reports per-point times relative to an internal
        // reference and may go negative; rebase so the earliest kept
        // point sits at offset zero.
        let time_base = match self.config.lidar_type {
            LidarType::Velo32 => frame
                .points
                .iter()
                .map(|p| p.time)
                .fold(f64::INFINITY, f64::min),
            LidarType::Avia | LidarType::Oust64 => 0.0,
        };
        let time_base = if time_base.is_finite() { time_base } else { 0.0 };

        let mut cloud = PointCloud3D::with_capacity(frame.points.len() / filter_num + 1);
        for (i, raw) in frame.points.iter().enumerate() {
            if i % filter_num != 0 {
                continue;
            }
            let position = Vector3::new(raw.x, raw.y, raw.z);
            if position.norm_squared() < blind_sq {
                continue;
            }
            cloud.push(Point3D {
                position,
                intensity: raw.intensity,
                time_offset: (raw.time - time_base) * self.config.time_scale,
            });
        }
        cloud
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame_with_times(times: &[f64]) -> RawScanFrame {
        RawScanFrame {
            timestamp: 10.0,
            points: times
                .iter()
                .enumerate()
                .map(|(i, &t)| RawPoint {
                    x: 1.0 + i as f64,
                    y: 0.0,
                    z: 0.0,
                    intensity: 50.0,
                    time: t,
                })
                .collect(),
        }
    }

    fn decoder(lidar_type: LidarType, filter_num: usize) -> PointDecoder {
        PointDecoder::new(PointDecoderConfig {
            lidar_type,
            blind: 0.5,
            time_scale: 1e-3,
            point_filter_num: filter_num,
        })
    }

    #[test]
    fn test_avia_time_scaling() {
        let frame = frame_with_times(&[0.0, 25.0, 50.0]);
        let cloud = decoder(LidarType::Avia, 1).decode(&frame);
        assert_eq!(cloud.len(), 3);
        assert_relative_eq!(cloud.points[1].time_offset, 0.025);
        assert_relative_eq!(cloud.points[2].time_offset, 0.05);
    }

    #[test]
    fn test_velodyne_rebases_negative_times() {
        let frame = frame_with_times(&[-40.0, -20.0, 0.0, 20.0]);
        let cloud = decoder(LidarType::Velo32, 1).decode(&frame);
        assert_relative_eq!(cloud.points[0].time_offset, 0.0);
        assert_relative_eq!(cloud.points[3].time_offset, 0.06);
    }

    #[test]
    fn test_point_decimation() {
        let frame = frame_with_times(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let cloud = decoder(LidarType::Avia, 2).decode(&frame);
        assert_eq!(cloud.len(), 3);
        assert_relative_eq!(cloud.points[1].position.x, 3.0);
    }

    #[test]
    fn test_blind_gate_drops_near_returns() {
        let mut frame = frame_with_times(&[0.0, 1.0]);
        frame.points[0].x = 0.2; // inside the 0.5 m blind zone
        let cloud = decoder(LidarType::Avia, 1).decode(&frame);
        assert_eq!(cloud.len(), 1);
        assert_relative_eq!(cloud.points[0].position.x, 2.0);
    }

    #[test]
    fn test_empty_frame() {
        let frame = RawScanFrame::default();
        let cloud = decoder(LidarType::Oust64, 1).decode(&frame);
        assert!(cloud.is_empty());
    }
}

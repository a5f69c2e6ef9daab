//! IMU processing: bias initialisation, forward propagation and per-point
//! motion compensation.
//!
//! The processor owns the carry-over between bundles (the last IMU sample,
//! so the first integration interval of the next bundle has a bracket) and
//! the per-bundle pose cache used to interpolate the platform trajectory
//! at each LiDAR point's acquisition time.

use log::{info, warn};
use nalgebra::{UnitQuaternion, Vector3};

use crate::algorithms::ieskf::Ieskf;
use crate::core::types::{ImuReading, MeasureBundle, Point3D, PointCloud3D, GRAVITY_NORM};

/// IMU processor options.
#[derive(Debug, Clone, Copy)]
pub struct ImuProcessorConfig {
    /// Samples accumulated before the filter state is seeded. Default: 20
    pub init_samples: usize,

    /// Lidar-to-IMU extrinsic rotation, written into the filter state at
    /// initialisation.
    pub ext_rot: UnitQuaternion<f64>,

    /// Lidar-to-IMU extrinsic translation.
    pub ext_trans: Vector3<f64>,
}

impl Default for ImuProcessorConfig {
    fn default() -> Self {
        Self {
            init_samples: 20,
            ext_rot: UnitQuaternion::identity(),
            ext_trans: Vector3::zeros(),
        }
    }
}

/// One cached pose along the intra-scan trajectory.
#[derive(Debug, Clone, Copy)]
struct ImuPose {
    /// Seconds since the bundle's scan start.
    offset: f64,
    rot: UnitQuaternion<f64>,
    pos: Vector3<f64>,
}

/// Bias tracking, forward integration and de-skew.
pub struct ImuProcessor {
    config: ImuProcessorConfig,
    initialized: bool,
    init_count: usize,
    mean_gyr: Vector3<f64>,
    mean_acc: Vector3<f64>,
    last_imu: Option<ImuReading>,
    /// Rebuilt every bundle.
    pose_cache: Vec<ImuPose>,
}

impl ImuProcessor {
    /// Create an uninitialised processor.
    pub fn new(config: ImuProcessorConfig) -> Self {
        Self {
            config,
            initialized: false,
            init_count: 0,
            mean_gyr: Vector3::zeros(),
            mean_acc: Vector3::zeros(),
            last_imu: None,
            pose_cache: Vec::new(),
        }
    }

    /// Whether enough samples have been seen to seed the filter.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Restore the uninitialised state.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.init_count = 0;
        self.mean_gyr = Vector3::zeros();
        self.mean_acc = Vector3::zeros();
        self.last_imu = None;
        self.pose_cache.clear();
    }

    /// Propagate the filter across the bundle's IMU window and de-skew the
    /// scan into the lidar frame at scan-end time.
    ///
    /// Returns `None` while the processor is still accumulating its
    /// initialisation window (the filter state is seeded once enough
    /// samples are in) or when the bundle carries no IMU data.
    pub fn process(&mut self, bundle: &MeasureBundle, kf: &mut Ieskf) -> Option<PointCloud3D> {
        if bundle.imu.is_empty() {
            warn!("bundle without IMU samples, skipping");
            return None;
        }

        if !self.initialized {
            self.try_initialize(bundle, kf);
            self.last_imu = bundle.imu.last().copied();
            return None;
        }

        let undistorted = self.undistort(bundle, kf);
        self.last_imu = bundle.imu.last().copied();
        Some(undistorted)
    }

    /// Accumulate mean angular velocity and specific force; once the window
    /// is full, seed gyro bias and gravity and declare initialised.
    fn try_initialize(&mut self, bundle: &MeasureBundle, kf: &mut Ieskf) {
        for sample in &bundle.imu {
            self.init_count += 1;
            let n = self.init_count as f64;
            self.mean_gyr += (sample.angular_velocity - self.mean_gyr) / n;
            self.mean_acc += (sample.linear_acceleration - self.mean_acc) / n;
        }

        if self.init_count < self.config.init_samples {
            return;
        }

        let state = kf.state_mut();
        state.grav = -self.mean_acc.normalize() * GRAVITY_NORM;
        state.bias_gyro = self.mean_gyr;
        state.rot = UnitQuaternion::identity();
        state.vel = Vector3::zeros();
        state.ext_rot = self.config.ext_rot;
        state.ext_trans = self.config.ext_trans;
        self.initialized = true;
        info!(
            "IMU initialised from {} samples, gravity [{:.3}, {:.3}, {:.3}], gyro bias norm {:.5}",
            self.init_count, state.grav.x, state.grav.y, state.grav.z, state.bias_gyro.norm()
        );
    }

    /// Forward-propagate through every sample, caching the intermediate
    /// poses, then re-express each point in the lidar frame at scan end.
    fn undistort(&mut self, bundle: &MeasureBundle, kf: &mut Ieskf) -> PointCloud3D {
        let t_begin = bundle.scan_time;

        self.pose_cache.clear();
        {
            let s = kf.state();
            self.pose_cache.push(ImuPose {
                offset: 0.0,
                rot: s.rot,
                pos: s.pos,
            });
        }

        // The carried sample from the previous bundle brackets the first
        // interval; without one, integration starts at the scan time.
        let mut last_time = match self.last_imu {
            Some(prev) => prev.timestamp.min(t_begin),
            None => t_begin,
        };

        for sample in &bundle.imu {
            let dt = sample.timestamp - last_time;
            if dt > 0.0 {
                kf.predict(&sample.angular_velocity, &sample.linear_acceleration, dt);
                last_time = sample.timestamp;
            }
            // Samples that precede the scan (drained from the previous
            // window's tail) propagate the state but get no cache entry;
            // the cache must stay monotone in offset.
            let offset = sample.timestamp - t_begin;
            if offset > self.pose_cache[self.pose_cache.len() - 1].offset {
                let s = kf.state();
                self.pose_cache.push(ImuPose {
                    offset,
                    rot: s.rot,
                    pos: s.pos,
                });
            }
        }

        // Tail: carry the last sample forward to the scan end time.
        if let Some(last_sample) = bundle.imu.last() {
            let dt_end = bundle.scan_end_time - last_time;
            if dt_end > 0.0 {
                kf.predict(
                    &last_sample.angular_velocity,
                    &last_sample.linear_acceleration,
                    dt_end,
                );
            }
        }
        {
            let s = kf.state();
            self.pose_cache.push(ImuPose {
                offset: bundle.scan_end_time - t_begin,
                rot: s.rot,
                pos: s.pos,
            });
        }

        let end = *kf.state();
        let rot_end_inv = end.rot.inverse();
        let ext_rot = end.ext_rot;
        let ext_rot_inv = end.ext_rot.inverse();
        let ext_trans = end.ext_trans;

        let mut out = PointCloud3D::with_capacity(bundle.scan.len());
        for point in &bundle.scan {
            let (rot_tau, pos_tau) = self.interpolate(point.time_offset);
            // World position at acquisition time, then back into the lidar
            // frame at scan end.
            let p_world = rot_tau * (ext_rot * point.position + ext_trans) + pos_tau;
            let p_body_end = rot_end_inv * (p_world - end.pos);
            let p_lidar_end = ext_rot_inv * (p_body_end - ext_trans);
            out.push(Point3D {
                position: p_lidar_end,
                intensity: point.intensity,
                time_offset: point.time_offset,
            });
        }
        out
    }

    /// Pose at `offset` seconds after scan start, interpolated between the
    /// bracketing cache entries (slerp rotation, lerp translation). Offsets
    /// outside the cached range clamp to its ends.
    fn interpolate(&self, offset: f64) -> (UnitQuaternion<f64>, Vector3<f64>) {
        let cache = &self.pose_cache;
        let upper = cache.partition_point(|p| p.offset <= offset);
        if upper == 0 {
            let first = &cache[0];
            return (first.rot, first.pos);
        }
        if upper >= cache.len() {
            let last = &cache[cache.len() - 1];
            return (last.rot, last.pos);
        }
        let a = &cache[upper - 1];
        let b = &cache[upper];
        let span = b.offset - a.offset;
        if span <= 0.0 {
            return (b.rot, b.pos);
        }
        let alpha = ((offset - a.offset) / span).clamp(0.0, 1.0);
        (a.rot.slerp(&b.rot, alpha), a.pos.lerp(&b.pos, alpha))
    }
}

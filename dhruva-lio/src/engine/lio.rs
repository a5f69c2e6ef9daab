//! Pipeline driver: lifecycle, per-bundle processing and map maintenance.
//!
//! One [`run_once`](LioEngine::run_once) call drains at most one bundle
//! from the synchroniser and runs it to completion: IMU propagation and
//! de-skew, scan downsampling, the iterated measurement update, the map
//! increment and output assembly. The driver is single-threaded; the only
//! state it shares with the intake callbacks is the synchroniser's buffer
//! mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};

use crate::algorithms::ieskf::{Ieskf, IeskfConfig, UpdateOutcome};
use crate::algorithms::mapping::{IVox, IVoxConfig};
use crate::algorithms::matching::{PointToPlaneConfig, PointToPlaneObserver};
use crate::config::LioConfig;
use crate::core::types::{ImuReading, MeasureBundle, NavState, Point3D, PointCloud3D};
use crate::error::Result;
use crate::io::messages::{FrameOutput, FrameTransform, OdometryMessage, PoseStamped};
use crate::io::{pcd, trajectory};
use crate::sensors::imu::{ImuProcessor, ImuProcessorConfig};
use crate::sensors::preprocessing::{PointDecoder, PointDecoderConfig, RawScanFrame, VoxelDownsampler};

use super::sync::{MeasureSync, SyncConfig};

/// Seconds of LiDAR time before the filter is considered settled enough
/// for the map-increment downsample policy.
pub const INIT_TIME: f64 = 0.1;

/// Minimum downsampled points for a bundle to be worth estimating on.
const MIN_SCAN_POINTS: usize = 5;

/// Driver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Draining bundles, publishing an identity pose, not estimating.
    Idle,
    /// Waiting for the first bundle to seed the map.
    Bootstrapping,
    /// Estimating odometry and growing the map.
    Running,
}

/// Sensor-side intake handle, cheap to clone into transport callbacks.
///
/// Decodes raw frames and pushes them into the shared synchroniser; the
/// driver pulls bundles from the same buffers.
#[derive(Clone)]
pub struct SensorIntake {
    decoder: PointDecoder,
    sync: Arc<MeasureSync>,
}

impl SensorIntake {
    /// Decode and buffer one raw LiDAR frame.
    pub fn on_point_cloud(&self, frame: &RawScanFrame) {
        let cloud = self.decoder.decode(frame);
        self.sync.push_scan(frame.timestamp, cloud);
    }

    /// Buffer one IMU sample.
    pub fn on_imu(&self, sample: ImuReading) {
        self.sync.push_imu(sample);
    }
}

/// The LiDAR-inertial odometry engine.
pub struct LioEngine {
    config: LioConfig,
    sync: Arc<MeasureSync>,
    decoder: PointDecoder,
    surf_filter: VoxelDownsampler,
    imu: ImuProcessor,
    kf: Ieskf,
    ivox: IVox,
    observer: PointToPlaneObserver,

    state: EngineState,
    first_lidar_time: f64,
    ekf_inited: bool,
    path: Vec<PoseStamped>,

    output_dir: PathBuf,
    pcd_accum: PointCloud3D,
    pcd_index: usize,
    frames_since_pcd: i64,
    frame_count: u64,
}

impl LioEngine {
    /// Build the engine from a validated configuration.
    pub fn new(config: LioConfig) -> Result<Self> {
        config.validate()?;

        let observer_config = PointToPlaneConfig {
            plane_threshold: config.esti_plane_threshold,
            extrinsic_est_en: config.mapping.extrinsic_est_en,
            ..PointToPlaneConfig::default()
        };

        let ivox = IVox::new(IVoxConfig {
            resolution: config.ivox_grid_resolution,
            nearby_type: config.nearby_type()?,
            max_match_points: observer_config.max_match_points,
        });

        let ext_rot = UnitQuaternion::from_matrix(&config.extrinsic_rotation()?);
        let ext_trans = config.extrinsic_translation()?;

        let imu = ImuProcessor::new(ImuProcessorConfig {
            init_samples: 20,
            ext_rot,
            ext_trans,
        });

        let kf = Ieskf::new(IeskfConfig {
            max_iterations: config.max_iteration,
            gyr_cov: config.mapping.gyr_cov,
            acc_cov: config.mapping.acc_cov,
            b_gyr_cov: config.mapping.b_gyr_cov,
            b_acc_cov: config.mapping.b_acc_cov,
            ..IeskfConfig::default()
        });

        let sync = Arc::new(MeasureSync::new(SyncConfig {
            time_sync_en: config.common.time_sync_en,
            time_offset_lidar_to_imu: config.common.time_offset_lidar_to_imu,
        }));

        let decoder = PointDecoder::new(PointDecoderConfig {
            lidar_type: config.preprocess.lidar_type,
            blind: config.preprocess.blind,
            time_scale: config.preprocess.time_scale,
            point_filter_num: config.point_filter_num,
        });

        if config.feature_extract_enable {
            warn!("feature extraction is not supported, using raw surface points");
        }
        info!(
            "lio engine: ivox resolution {} m, nearby type {}, operational cube {} m, detection range {} m",
            config.ivox_grid_resolution,
            config.ivox_nearby_type,
            config.cube_side_length,
            config.mapping.det_range,
        );

        Ok(Self {
            surf_filter: VoxelDownsampler::new(config.filter_size_surf),
            observer: PointToPlaneObserver::new(observer_config),
            decoder,
            sync,
            imu,
            kf,
            ivox,
            config,
            state: EngineState::Idle,
            first_lidar_time: 0.0,
            ekf_inited: false,
            path: Vec::new(),
            output_dir: PathBuf::from("."),
            pcd_accum: PointCloud3D::new(),
            pcd_index: 0,
            frames_since_pcd: 0,
            frame_count: 0,
        })
    }

    /// Intake handle for the transport layer.
    pub fn intake(&self) -> SensorIntake {
        SensorIntake {
            decoder: self.decoder.clone(),
            sync: Arc::clone(&self.sync),
        }
    }

    /// The shared synchroniser (for feeding canonical clouds directly).
    pub fn sync(&self) -> &MeasureSync {
        &self.sync
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Current navigation state estimate.
    pub fn current_state(&self) -> &NavState {
        self.kf.state()
    }

    /// The incremental map.
    pub fn map(&self) -> &IVox {
        &self.ivox
    }

    /// Accumulated trajectory, one pose per processed frame.
    pub fn path(&self) -> &[PoseStamped] {
        &self.path
    }

    /// Number of frames that completed the full estimation pipeline.
    pub fn frames_processed(&self) -> u64 {
        self.frame_count
    }

    /// Directory for point-cloud snapshots. Defaults to the working
    /// directory.
    pub fn set_output_dir(&mut self, dir: &Path) {
        self.output_dir = dir.to_path_buf();
    }

    /// Begin odometry: the next bundle seeds the map.
    pub fn start(&mut self) {
        if self.state == EngineState::Idle {
            self.path.clear();
            self.state = EngineState::Bootstrapping;
            info!("starting lidar odometry");
        } else {
            debug!("start requested while already {:?}", self.state);
        }
    }

    /// Stop odometry and clear the trajectory. Takes effect at this tick;
    /// the map is kept.
    pub fn stop(&mut self) {
        self.state = EngineState::Idle;
        self.path.clear();
        info!("stopping lidar odometry");
    }

    /// Full reset: map, filter, IMU state, buffers and trajectory.
    pub fn reset(&mut self) {
        self.ivox.reset();
        self.kf.reset();
        self.imu.reset();
        self.sync.clear();
        self.path.clear();
        self.pcd_accum.clear();
        self.state = EngineState::Idle;
        self.ekf_inited = false;
        self.frame_count = 0;
    }

    /// Process at most one bundle.
    ///
    /// Returns `None` when no bundle is ready, while the IMU is still
    /// initialising, on the bootstrap bundle (which seeds the map and
    /// emits nothing), and when a bundle is dropped for having too few
    /// points.
    pub fn run_once(&mut self) -> Option<FrameOutput> {
        let bundle = self.sync.pull()?;

        let Some(scan_undistort) = self.imu.process(&bundle, &mut self.kf) else {
            return None;
        };
        if scan_undistort.is_empty() {
            warn!("no points after de-skew, skipping scan");
            return None;
        }

        match self.state {
            EngineState::Idle => Some(self.idle_output(bundle.scan_end_time, &scan_undistort)),
            EngineState::Bootstrapping => {
                self.ivox.add_points(&scan_undistort.points);
                self.first_lidar_time = bundle.scan_time;
                self.ekf_inited = false;
                self.state = EngineState::Running;
                info!(
                    "first scan: seeded map with {} points across {} voxels",
                    scan_undistort.len(),
                    self.ivox.num_voxels()
                );
                None
            }
            EngineState::Running => self.process_running(&bundle, &scan_undistort),
        }
    }

    /// The Running-state per-bundle pipeline.
    fn process_running(
        &mut self,
        bundle: &MeasureBundle,
        scan_undistort: &PointCloud3D,
    ) -> Option<FrameOutput> {
        let scan_down_body = self.surf_filter.apply(scan_undistort);
        if scan_down_body.len() < MIN_SCAN_POINTS {
            warn!(
                "too few points ({} raw, {} downsampled), stopping odometry",
                scan_undistort.len(),
                scan_down_body.len()
            );
            self.state = EngineState::Idle;
            return None;
        }

        self.ekf_inited = bundle.scan_time - self.first_lidar_time >= INIT_TIME;

        self.observer.prepare(scan_down_body.len());
        let outcome = {
            let mut bound = self.observer.bind(&scan_down_body, &self.ivox);
            self.kf.update_iterated(&mut bound)
        };
        if outcome == UpdateOutcome::Invalid {
            warn!("measurement update invalid, keeping predicted state");
        }

        let scan_down_world = self.map_incremental(&scan_down_body);

        self.frame_count += 1;
        let output = self.assemble_output(bundle.scan_end_time, scan_undistort, scan_down_world);
        self.save_pcd_interval();
        Some(output)
    }

    /// Transform each downsampled point into the world frame under the
    /// final state and route it into one of the two insertion lanes.
    fn map_incremental(&mut self, scan_down_body: &PointCloud3D) -> PointCloud3D {
        let state = *self.kf.state();
        let sigma_map = self.config.filter_size_map;
        let k_match = self.observer.config().max_match_points;
        let correspondences = self.observer.correspondences();

        let n = scan_down_body.len();
        let mut world = PointCloud3D::with_capacity(n);
        let mut points_to_add = Vec::with_capacity(n);
        let mut no_need_downsample = Vec::with_capacity(n);

        for (i, point) in scan_down_body.iter().enumerate() {
            let p_world = Point3D {
                position: state.lidar_to_world(&point.position),
                intensity: point.intensity,
                time_offset: point.time_offset,
            };
            world.push(p_world);

            let nearest = correspondences
                .get(i)
                .map(|c| c.neighbors.as_slice())
                .unwrap_or(&[]);
            if nearest.is_empty() || !self.ekf_inited || sigma_map <= 0.0 {
                points_to_add.push(p_world);
                continue;
            }
            match map_increment_decision(&p_world.position, nearest, sigma_map, k_match) {
                MapAdd::NoDownsample => no_need_downsample.push(p_world),
                MapAdd::Append => points_to_add.push(p_world),
                MapAdd::Skip => {}
            }
        }

        self.ivox.add_points(&points_to_add);
        self.ivox.add_points(&no_need_downsample);
        world
    }

    /// Frame output with the real pose and covariance.
    fn assemble_output(
        &mut self,
        timestamp: f64,
        scan_undistort: &PointCloud3D,
        scan_down_world: PointCloud3D,
    ) -> FrameOutput {
        let state = *self.kf.state();
        let publish = &self.config.publish;

        let pose = PoseStamped {
            timestamp,
            position: state.pos,
            orientation: state.rot,
        };
        self.path.push(pose);

        let scan_world = if publish.scan_publish_en || self.config.pcd_save.pcd_save_en {
            let cloud = if publish.dense_publish_en {
                scan_undistort
                    .iter()
                    .map(|p| Point3D {
                        position: state.lidar_to_world(&p.position),
                        intensity: p.intensity,
                        time_offset: p.time_offset,
                    })
                    .collect()
            } else {
                scan_down_world
            };
            if self.config.pcd_save.pcd_save_en {
                self.pcd_accum.points.extend_from_slice(&cloud.points);
            }
            Some(cloud)
        } else {
            None
        };

        let scan_effect: Option<PointCloud3D> = publish.scan_effect_pub_en.then(|| {
            self.observer
                .world_cloud()
                .iter()
                .zip(self.observer.correspondences())
                .filter(|(_, corr)| corr.selected)
                .map(|(p, _)| *p)
                .collect()
        });

        let scan_body = if publish.scan_publish_en && publish.scan_bodyframe_pub_en {
            Some(
                scan_undistort
                    .iter()
                    .map(|p| Point3D {
                        position: state.lidar_to_body(&p.position),
                        intensity: p.intensity,
                        time_offset: p.time_offset,
                    })
                    .collect(),
            )
        } else {
            None
        };

        FrameOutput {
            odometry: OdometryMessage {
                timestamp,
                position: state.pos,
                orientation: state.rot,
                covariance: self.kf.covariance().fixed_view::<6, 6>(0, 0).into_owned(),
            },
            transform: FrameTransform {
                timestamp,
                translation: state.pos,
                rotation: state.rot,
            },
            scan_world: if publish.scan_publish_en {
                scan_world
            } else {
                None
            },
            scan_body,
            scan_effect,
            condition_numbers: self.observer.condition_numbers().to_vec(),
        }
    }

    /// Idle-state output: identity pose, the de-skewed scan under the
    /// IMU-propagated state, no estimation.
    fn idle_output(&mut self, timestamp: f64, scan_undistort: &PointCloud3D) -> FrameOutput {
        let state = *self.kf.state();
        self.path.clear();

        let scan_down = self.surf_filter.apply(scan_undistort);
        let scan_world = scan_down
            .iter()
            .map(|p| Point3D {
                position: state.lidar_to_world(&p.position),
                intensity: p.intensity,
                time_offset: p.time_offset,
            })
            .collect();

        FrameOutput {
            odometry: OdometryMessage {
                timestamp,
                position: Vector3::zeros(),
                orientation: UnitQuaternion::identity(),
                covariance: self.kf.covariance().fixed_view::<6, 6>(0, 0).into_owned(),
            },
            transform: FrameTransform {
                timestamp,
                translation: Vector3::zeros(),
                rotation: UnitQuaternion::identity(),
            },
            scan_world: self.config.publish.scan_publish_en.then_some(scan_world),
            scan_body: None,
            scan_effect: None,
            condition_numbers: Vec::new(),
        }
    }

    /// Interval snapshots: `scans_<k>.pcd` every `interval` frames.
    fn save_pcd_interval(&mut self) {
        let pcd = &self.config.pcd_save;
        if !pcd.pcd_save_en || pcd.interval <= 0 {
            return;
        }
        self.frames_since_pcd += 1;
        if self.frames_since_pcd < pcd.interval || self.pcd_accum.is_empty() {
            return;
        }
        self.pcd_index += 1;
        let file = self.output_dir.join(format!("scans_{}.pcd", self.pcd_index));
        match pcd::save_pcd(&file, &self.pcd_accum) {
            Ok(()) => info!("scan snapshot saved to {}", file.display()),
            Err(e) => warn!("failed to save {}: {e}", file.display()),
        }
        self.pcd_accum.clear();
        self.frames_since_pcd = 0;
    }

    /// Flush the remaining point-cloud accumulation and the trajectory.
    pub fn finish(&mut self) -> Result<()> {
        if self.config.pcd_save.pcd_save_en && !self.pcd_accum.is_empty() {
            let file = self.output_dir.join("scans.pcd");
            pcd::save_pcd(&file, &self.pcd_accum)?;
            info!("final scan accumulation saved to {}", file.display());
            self.pcd_accum.clear();
        }
        if self.config.path_save_en && !self.path.is_empty() {
            let file = self.output_dir.join("trajectory.txt");
            trajectory::save_trajectory(&file, &self.path)?;
            info!("trajectory saved to {}", file.display());
        }
        Ok(())
    }
}

/// Insertion lane for one world point during the map increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapAdd {
    /// The nearest neighbour is far from the point's map voxel centre on
    /// all three axes: append without the downsample policy.
    NoDownsample,
    /// Append through the regular downsample policy.
    Append,
    /// Enough closer points already cover this voxel.
    Skip,
}

/// The two-lane decision of the map increment rule.
///
/// The no-downsample lane requires the axis test to pass on all three
/// axes, which is stricter than any single-axis escape.
fn map_increment_decision(
    p_world: &Vector3<f64>,
    nearest: &[Point3D],
    sigma_map: f64,
    k_match: usize,
) -> MapAdd {
    let centre = Vector3::new(
        ((p_world.x / sigma_map).floor() + 0.5) * sigma_map,
        ((p_world.y / sigma_map).floor() + 0.5) * sigma_map,
        ((p_world.z / sigma_map).floor() + 0.5) * sigma_map,
    );

    let to_centre = nearest[0].position - centre;
    if to_centre.x.abs() > 0.5 * sigma_map
        && to_centre.y.abs() > 0.5 * sigma_map
        && to_centre.z.abs() > 0.5 * sigma_map
    {
        return MapAdd::NoDownsample;
    }

    let dist_sq = (p_world - centre).norm_squared();
    if nearest.len() >= k_match {
        for neighbor in &nearest[..k_match] {
            if (neighbor.position - centre).norm_squared() < dist_sq + 1e-6 {
                return MapAdd::Skip;
            }
        }
    }
    MapAdd::Append
}

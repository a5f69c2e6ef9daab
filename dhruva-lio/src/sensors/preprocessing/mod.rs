//! Scan preprocessing: raw decode and downsampling.

mod decoder;
mod voxel_filter;

pub use decoder::{PointDecoder, PointDecoderConfig, RawPoint, RawScanFrame};
pub use voxel_filter::VoxelDownsampler;

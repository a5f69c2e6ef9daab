//! Map representation: the incremental sparse voxel grid.

mod ivox;

pub use ivox::{IVox, IVoxConfig, VoxelIndex};

//! Trajectory text serialisation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::messages::PoseStamped;

/// Write the accumulated trajectory as text, one pose per row:
///
/// ```text
/// #timestamp x y z q_x q_y q_z q_w
/// ```
///
/// Timestamps carry 6 decimals, coordinates and quaternion components 15.
pub fn save_trajectory(path: &Path, poses: &[PoseStamped]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "#timestamp x y z q_x q_y q_z q_w")?;
    for pose in poses {
        let q = pose.orientation.coords;
        writeln!(
            writer,
            "{:.6} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15}",
            pose.timestamp,
            pose.position.x,
            pose.position.y,
            pose.position.z,
            q.x,
            q.y,
            q.z,
            q.w,
        )?;
    }
    writer.flush()
}

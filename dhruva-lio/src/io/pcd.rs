//! Minimal PCD (ASCII v0.7) point-cloud writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::core::types::PointCloud3D;

/// Write a cloud as ASCII PCD with x, y, z and intensity fields.
pub fn save_pcd(path: &Path, cloud: &PointCloud3D) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let n = cloud.len();
    writeln!(writer, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(writer, "VERSION 0.7")?;
    writeln!(writer, "FIELDS x y z intensity")?;
    writeln!(writer, "SIZE 4 4 4 4")?;
    writeln!(writer, "TYPE F F F F")?;
    writeln!(writer, "COUNT 1 1 1 1")?;
    writeln!(writer, "WIDTH {n}")?;
    writeln!(writer, "HEIGHT 1")?;
    writeln!(writer, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(writer, "POINTS {n}")?;
    writeln!(writer, "DATA ascii")?;
    for point in cloud {
        writeln!(
            writer,
            "{} {} {} {}",
            point.position.x as f32, point.position.y as f32, point.position.z as f32,
            point.intensity
        )?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point3D;

    #[test]
    fn test_save_pcd_header_and_rows() {
        let mut cloud = PointCloud3D::new();
        cloud.push(Point3D::new(1.0, 2.0, 3.0));
        cloud.push(Point3D::new(-1.0, 0.5, 0.25));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scans.pcd");
        save_pcd(&file, &cloud).unwrap();

        let contents = std::fs::read_to_string(&file).unwrap();
        assert!(contents.contains("FIELDS x y z intensity"));
        assert!(contents.contains("POINTS 2"));
        assert_eq!(contents.lines().count(), 13);
    }
}

//! Pose output in CSV form.
//!
//! One row per frame:
//! `frame_id, status, r00, r01, r02, r10, r11, r12, r20, r21, r22, tx, ty, tz`
//! with `status ∈ {OK, FAIL}`. Failed frames carry zeros in the pose fields.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use crate::geometry::SE3;

/// Streaming writer for the per-frame pose table.
pub struct PoseWriter {
    inner: csv::Writer<File>,
}

impl PoseWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("cannot create {}", path.as_ref().display()))?;
        Ok(Self {
            inner: csv::WriterBuilder::new().has_headers(false).from_writer(file),
        })
    }

    /// Append one frame row; `None` records a failed relocalisation.
    pub fn write(&mut self, frame_id: &str, pose: Option<&SE3>) -> Result<()> {
        let mut record = Vec::with_capacity(14);
        record.push(frame_id.to_string());
        match pose {
            Some(pose) => {
                record.push("OK".to_string());
                let rotation = pose.rotation_matrix();
                for r in 0..3 {
                    for c in 0..3 {
                        record.push(format!("{}", rotation[(r, c)]));
                    }
                }
                for i in 0..3 {
                    record.push(format!("{}", pose.translation[i]));
                }
            }
            None => {
                record.push("FAIL".to_string());
                record.extend(std::iter::repeat_n("0".to_string(), 12));
            }
        }
        self.inner.write_record(&record)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn writes_ok_and_fail_rows() {
        let dir = std::env::temp_dir().join("score_reloc_pose_writer_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("poses.csv");

        let mut writer = PoseWriter::create(&path).unwrap();
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        writer.write("000000", Some(&pose)).unwrap();
        writer.write("000001", None).unwrap();
        writer.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "000000,OK,1,0,0,0,1,0,0,0,1,1,2,3"
        );
        assert_eq!(lines[1], "000001,FAIL,0,0,0,0,0,0,0,0,0,0,0,0");
        std::fs::remove_file(&path).ok();
    }
}

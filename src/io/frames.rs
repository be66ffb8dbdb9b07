//! Frame file loading.
//!
//! One binary file per frame, extension `.gfrm`, little-endian throughout:
//!
//! - Header: magic `"GFRM"`, u32 version = 1, u32 width, u32 height,
//!   u32 feature_count.
//! - width·height keypoint records `{f32 position[3], u8 colour[3], u8 valid}`
//!   in raster order.
//! - width·height·feature_count f32 descriptor values, features contiguous
//!   per pixel.
//!
//! The frame id is the file stem; a directory of frames is processed in
//! lexicographic stem order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nalgebra::Vector3;

use crate::image::{DescriptorImage, Image, Keypoint, KeypointImage};

const MAGIC: &[u8; 4] = b"GFRM";
const VERSION: u32 = 1;

/// One loaded RGB-D frame: keypoints plus forest input features.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub id: String,
    pub keypoints: KeypointImage,
    pub descriptors: DescriptorImage,
}

/// All `.gfrm` files of a directory, sorted by file stem.
pub fn list_frames<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read frames directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "gfrm"))
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("no .gfrm frames found in {}", dir.display());
    }
    Ok(paths)
}

/// Load one frame file.
pub fn load_frame<P: AsRef<Path>>(path: P) -> Result<FrameData> {
    let path = path.as_ref();
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("frame")
        .to_string();
    let file =
        File::open(path).with_context(|| format!("cannot open frame {}", path.display()))?;
    let mut reader = BufReader::new(file);
    read_frame(&mut reader, id).with_context(|| format!("malformed frame {}", path.display()))
}

/// Read a frame from any byte stream.
pub fn read_frame<R: Read>(reader: &mut R, id: String) -> Result<FrameData> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("bad magic bytes");
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        bail!("unsupported frame version {version} (expected {VERSION})");
    }
    let width = read_u32(reader)? as usize;
    let height = read_u32(reader)? as usize;
    let feature_count = read_u32(reader)? as usize;
    let pixel_count = width * height;

    let mut keypoints = Vec::with_capacity(pixel_count);
    for _ in 0..pixel_count {
        let x = read_f32(reader)? as f64;
        let y = read_f32(reader)? as f64;
        let z = read_f32(reader)? as f64;
        let mut colour = [0u8; 3];
        reader.read_exact(&mut colour)?;
        let mut valid = [0u8; 1];
        reader.read_exact(&mut valid)?;
        keypoints.push(Keypoint {
            position: Vector3::new(x, y, z),
            colour,
            valid: valid[0] != 0,
        });
    }

    let mut descriptors = vec![0.0f32; pixel_count * feature_count];
    for value in &mut descriptors {
        *value = read_f32(reader)?;
    }

    Ok(FrameData {
        id,
        keypoints: Image::from_raw(width, height, keypoints)
            .expect("keypoint buffer sized from the header"),
        descriptors: DescriptorImage::from_raw(width, height, feature_count, descriptors)
            .expect("descriptor buffer sized from the header"),
    })
}

/// Write a frame file; the inverse of [`load_frame`].
pub fn save_frame<P: AsRef<Path>>(frame: &FrameData, path: P) -> Result<()> {
    let file = File::create(path.as_ref())
        .with_context(|| format!("cannot create frame {}", path.as_ref().display()))?;
    let mut writer = BufWriter::new(file);
    write_frame(&mut writer, frame)?;
    writer.flush()?;
    Ok(())
}

/// Write a frame to any byte stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &FrameData) -> Result<()> {
    let (width, height) = frame.keypoints.dims();
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(width as u32).to_le_bytes())?;
    writer.write_all(&(height as u32).to_le_bytes())?;
    writer.write_all(&(frame.descriptors.feature_count() as u32).to_le_bytes())?;

    for keypoint in frame.keypoints.as_slice() {
        for i in 0..3 {
            writer.write_all(&(keypoint.position[i] as f32).to_le_bytes())?;
        }
        writer.write_all(&keypoint.colour)?;
        writer.write_all(&[u8::from(keypoint.valid)])?;
    }
    for raster in 0..width * height {
        for &value in frame.descriptors.features(raster) {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

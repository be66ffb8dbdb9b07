//! Binary serialisation of frozen forests.
//!
//! Format (all little-endian, IEEE-754 f32):
//!
//! - Header: magic `"GFOR"`, u32 version = 1, u32 tree_count,
//!   u32 max_modes_per_leaf, u32 feature_count.
//! - For each tree: u32 node_count, then node_count records of
//!   `{i32 left, i32 right, u32 feature, f32 threshold}`; a leaf is encoded
//!   as `left == -1`.
//! - For each tree: u32 leaf_count, then per leaf a u32 mode_count followed
//!   by mode records `{f32 mean[3], f32 inv_cov[9] row-major, f32 log_det,
//!   u32 samples, u8 colour[3], u8 pad}`.
//!
//! The layout is bit-exact for compatibility with forests exported by the
//! training pipeline; writing a loaded forest back reproduces the file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use tracing::info;

use super::{Mode, ScoreForest, SplitNode, Tree};
use crate::error::ForestLoadError;

const MAGIC: &[u8; 4] = b"GFOR";
const VERSION: u32 = 1;

impl ScoreForest {
    /// Load a frozen forest from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ForestLoadError> {
        let file = File::open(path.as_ref())?;
        let forest = Self::read_from(&mut BufReader::new(file))?;
        info!(
            trees = forest.tree_count(),
            feature_count = forest.feature_count(),
            leaves = forest.trees().iter().map(Tree::leaf_count).sum::<usize>(),
            "loaded score forest"
        );
        Ok(forest)
    }

    /// Read a forest from any byte stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ForestLoadError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ForestLoadError::Format("bad magic bytes".into()));
        }
        let version = read_u32(reader)?;
        if version != VERSION {
            return Err(ForestLoadError::Version {
                expected: VERSION,
                found: version,
            });
        }
        let tree_count = read_u32(reader)? as usize;
        let max_modes_per_leaf = read_u32(reader)?;
        let feature_count = read_u32(reader)?;
        if tree_count == 0 {
            return Err(ForestLoadError::Format("zero trees".into()));
        }

        // First block: node arrays for every tree.
        let mut node_arrays = Vec::with_capacity(tree_count);
        for _ in 0..tree_count {
            let node_count = read_u32(reader)? as usize;
            let mut nodes = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                nodes.push(SplitNode {
                    left: read_i32(reader)?,
                    right: read_i32(reader)?,
                    feature: read_u32(reader)?,
                    threshold: read_f32(reader)?,
                });
            }
            node_arrays.push(nodes);
        }

        // Second block: per-leaf mode tables for every tree.
        let mut trees = Vec::with_capacity(tree_count);
        for nodes in node_arrays {
            let leaf_count = read_u32(reader)? as usize;
            let mut leaf_modes = Vec::with_capacity(leaf_count);
            for _ in 0..leaf_count {
                let mode_count = read_u32(reader)? as usize;
                if mode_count > max_modes_per_leaf as usize {
                    return Err(ForestLoadError::Format(format!(
                        "leaf mode count {mode_count} exceeds declared maximum {max_modes_per_leaf}"
                    )));
                }
                let mut modes = Vec::with_capacity(mode_count);
                for _ in 0..mode_count {
                    modes.push(read_mode(reader)?);
                }
                leaf_modes.push(modes);
            }
            trees.push(Tree::new(nodes, leaf_modes)?);
        }

        ScoreForest::new(trees, max_modes_per_leaf, feature_count)
    }

    /// Write the forest in the same binary layout it is loaded from.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ForestLoadError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write the forest to any byte stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ForestLoadError> {
        writer.write_all(MAGIC)?;
        write_u32(writer, VERSION)?;
        write_u32(writer, self.tree_count() as u32)?;
        write_u32(writer, self.max_modes_per_leaf())?;
        write_u32(writer, self.feature_count())?;

        for tree in self.trees() {
            write_u32(writer, tree.nodes().len() as u32)?;
            for node in tree.nodes() {
                write_i32(writer, node.left)?;
                write_i32(writer, node.right)?;
                write_u32(writer, node.feature)?;
                write_f32(writer, node.threshold)?;
            }
        }

        for tree in self.trees() {
            write_u32(writer, tree.leaf_count() as u32)?;
            for leaf in 0..tree.leaf_count() as u32 {
                let modes = tree.modes(leaf);
                write_u32(writer, modes.len() as u32)?;
                for mode in modes {
                    write_mode(writer, mode)?;
                }
            }
        }
        Ok(())
    }
}

fn read_mode<R: Read>(reader: &mut R) -> Result<Mode, ForestLoadError> {
    let mut mean = [0.0f64; 3];
    for v in &mut mean {
        *v = read_f32(reader)? as f64;
    }
    let mut inv_cov = [0.0f64; 9];
    for v in &mut inv_cov {
        *v = read_f32(reader)? as f64;
    }
    let log_det_cov = read_f32(reader)? as f64;
    let samples = read_u32(reader)?;
    if samples == 0 {
        return Err(ForestLoadError::Format("mode with zero samples".into()));
    }
    let mut colour = [0u8; 3];
    reader.read_exact(&mut colour)?;
    let mut pad = [0u8; 1];
    reader.read_exact(&mut pad)?;
    Ok(Mode {
        mean: Vector3::from_row_slice(&mean),
        inv_cov: Matrix3::from_row_slice(&inv_cov),
        log_det_cov,
        samples,
        colour,
    })
}

fn write_mode<W: Write>(writer: &mut W, mode: &Mode) -> Result<(), ForestLoadError> {
    for i in 0..3 {
        write_f32(writer, mode.mean[i] as f32)?;
    }
    for r in 0..3 {
        for c in 0..3 {
            write_f32(writer, mode.inv_cov[(r, c)] as f32)?;
        }
    }
    write_f32(writer, mode.log_det_cov as f32)?;
    write_u32(writer, mode.samples)?;
    writer.write_all(&mode.colour)?;
    writer.write_all(&[0u8])?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ForestLoadError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, ForestLoadError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32, ForestLoadError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<(), ForestLoadError> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i32<W: Write>(writer: &mut W, v: i32) -> Result<(), ForestLoadError> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(writer: &mut W, v: f32) -> Result<(), ForestLoadError> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

// Mesh loading and vertex deduplication
//
// OBJ files index positions, normals and texcoords separately. We expand
// every face corner into a full interleaved vertex, then fold identical
// vertices back together through a remap table so the GPU vertex cache
// sees each unique vertex once.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::backend::buffer::Buffer;
use crate::error::RendererError;

/// Normal used for face corners that carry no normal index
pub const DEFAULT_NORMAL: Vec3 = Vec3::Z;
/// Texcoord used for face corners that carry no texcoord index
pub const DEFAULT_TEXCOORD: Vec2 = Vec2::ZERO;

/// Interleaved vertex, 32 bytes, matches the pipeline's vertex input layout
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub texcoord: Vec2,
}

/// Bitwise identity of a vertex. Two vertices dedupe only when every float
/// matches exactly.
type VertexKey = [u32; 8];

impl Vertex {
    fn key(&self) -> VertexKey {
        bytemuck::cast(*self)
    }
}

/// Immutable vertex pool plus the index list referencing it
#[derive(Debug, Clone)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

impl Mesh {
    /// Load an OBJ file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RendererError::Model {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mesh = Self::parse(&mut BufReader::new(file), path)?;

        log::info!(
            "Loaded {:?}: {} indices, {} unique vertices",
            path,
            mesh.index_count(),
            mesh.vertex_count()
        );
        Ok(mesh)
    }

    /// Parse OBJ text. `origin` only names the source in error messages.
    pub fn parse<R: BufRead>(reader: &mut R, origin: &Path) -> Result<Self> {
        let model_error = |reason: String| RendererError::Model {
            path: origin.to_path_buf(),
            reason,
        };

        // Keep the per-channel indices; unifying them is our job
        let options = tobj::LoadOptions {
            single_index: false,
            triangulate: true,
            ignore_points: true,
            ignore_lines: true,
            ..Default::default()
        };

        let mut source = String::new();
        reader
            .read_to_string(&mut source)
            .map_err(|e| model_error(e.to_string()))?;

        let (models, _) = tobj::load_obj_buf(&mut source.as_bytes(), &options, |_| Ok(Default::default()))
            .map_err(|e| model_error(e.to_string()))?;

        let channels = corner_channels(&source);
        let corners = expand_corners(&models, &channels).map_err(model_error)?;
        if corners.is_empty() {
            return Err(model_error("model contains no faces".to_string()).into());
        }

        Ok(Self::from_corners(&corners))
    }

    /// Build a mesh from one vertex per face corner
    pub fn from_corners(corners: &[Vertex]) -> Self {
        let (vertices, indices) = deduplicate(corners);
        Self { vertices, indices }
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Fails when either pool is larger than the buffer meant to hold it
    pub fn check_capacity(&self, vertex_capacity: usize, index_capacity: usize) -> Result<(), RendererError> {
        let fits = |pool: &'static str, needed: usize, capacity: usize| {
            if needed <= capacity {
                Ok(())
            } else {
                Err(RendererError::BufferTooSmall {
                    pool,
                    needed,
                    capacity,
                })
            }
        };

        fits("vertex", self.vertex_bytes().len(), vertex_capacity)?;
        fits("index", self.index_bytes().len(), index_capacity)
    }

    /// Copy both pools to the start of their buffers
    pub fn upload(&self, vertex_buffer: &mut Buffer, index_buffer: &mut Buffer) -> Result<()> {
        self.check_capacity(vertex_buffer.capacity(), index_buffer.capacity())?;
        vertex_buffer.write(0, self.vertex_bytes());
        index_buffer.write(0, self.index_bytes());
        Ok(())
    }
}

/// Fold identical vertices together, returning the unique pool and the
/// rewritten index list. Unique vertices keep first-occurrence order.
pub fn deduplicate(corners: &[Vertex]) -> (Vec<Vertex>, Vec<u32>) {
    let mut remap: HashMap<VertexKey, u32> = HashMap::with_capacity(corners.len());
    let mut vertices = Vec::new();
    let mut indices = Vec::with_capacity(corners.len());

    for corner in corners {
        let index = *remap.entry(corner.key()).or_insert_with(|| {
            vertices.push(*corner);
            (vertices.len() - 1) as u32
        });
        indices.push(index);
    }

    (vertices, indices)
}

/// Which optional channels a face corner actually names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CornerChannels {
    texcoord: bool,
    normal: bool,
}

/// Channel presence for every triangulated corner, in file order.
///
/// tobj fills a corner without a `vt` or `vn` index with its neighbour's,
/// so the only record of what a corner really carries is the face line
/// itself. Faces are fanned from their first corner the same way tobj
/// triangulates them; points and lines are skipped as they are at load.
fn corner_channels(source: &str) -> Vec<CornerChannels> {
    let mut channels = Vec::new();

    for line in source.lines() {
        let mut words = line.split_whitespace();
        if !matches!(words.next(), Some("f") | Some("l")) {
            continue;
        }

        let face: Vec<CornerChannels> = words
            .map(|corner| {
                let mut slots = corner.split('/').skip(1);
                let texcoord = slots.next().is_some_and(|slot| !slot.is_empty());
                let normal = slots.next().is_some_and(|slot| !slot.is_empty());
                CornerChannels { texcoord, normal }
            })
            .collect();

        if face.len() < 3 {
            continue;
        }
        for i in 1..face.len() - 1 {
            channels.extend([face[0], face[i], face[i + 1]]);
        }
    }

    channels
}

/// Expand every face corner of every model into an interleaved vertex.
///
/// `channels` holds one entry per corner across all models. A corner that
/// names no normal gets `DEFAULT_NORMAL`, one that names no texcoord gets
/// `DEFAULT_TEXCOORD`, whatever index tobj padded in for it.
fn expand_corners(models: &[tobj::Model], channels: &[CornerChannels]) -> Result<Vec<Vertex>, String> {
    let corner_total: usize = models.iter().map(|m| m.mesh.indices.len()).sum();
    if corner_total != channels.len() {
        return Err(format!(
            "parsed {} face corners but the face lines describe {}",
            corner_total,
            channels.len()
        ));
    }

    let mut corners = Vec::with_capacity(corner_total);
    let mut channels = channels.iter();
    let mut defaulted = 0usize;

    for model in models {
        let mesh = &model.mesh;

        for (corner, present) in (0..mesh.indices.len()).zip(channels.by_ref()) {
            let position = vec3_at(&mesh.positions, mesh.indices[corner])
                .ok_or_else(|| format!("{}: position index out of range", model.name))?;

            let normal = match mesh.normal_indices.get(corner) {
                Some(&index) if present.normal => vec3_at(&mesh.normals, index)
                    .ok_or_else(|| format!("{}: normal index out of range", model.name))?,
                _ => DEFAULT_NORMAL,
            };

            let texcoord = match mesh.texcoord_indices.get(corner) {
                Some(&index) if present.texcoord => vec2_at(&mesh.texcoords, index)
                    .ok_or_else(|| format!("{}: texcoord index out of range", model.name))?,
                _ => DEFAULT_TEXCOORD,
            };

            if !(present.normal && present.texcoord) {
                defaulted += 1;
            }

            corners.push(Vertex {
                position,
                normal,
                texcoord,
            });
        }
    }

    if defaulted > 0 {
        log::debug!("{} of {} corners use a default normal or texcoord", defaulted, corner_total);
    }

    Ok(corners)
}

fn vec3_at(data: &[f32], index: u32) -> Option<Vec3> {
    let start = index as usize * 3;
    data.get(start..start + 3).map(Vec3::from_slice)
}

fn vec2_at(data: &[f32], index: u32) -> Option<Vec2> {
    let start = index as usize * 2;
    data.get(start..start + 2).map(Vec2::from_slice)
}

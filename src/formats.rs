//! Packed byte layouts for the output stage.
//!
//! Meshes encode as PLY (binary little-endian) or BOBJ (length-prefixed
//! raw buffers). Whitewater and fluid-particle streams use simple
//! length-prefixed layouts; the fluid-particle FFP3 layout is a
//! three-bucket header (surface/boundary/interior) with each bucket
//! pre-sorted by particle ID so truncation by ID limit is
//! deterministic.

use glam::Vec3;

use crate::mesh::TriangleMesh;

/// Mesh encoding selector.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum MeshOutputFormat {
    Ply,
    Bobj,
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_vec3s(out: &mut Vec<u8>, vs: &[Vec3]) {
    out.extend_from_slice(bytemuck::cast_slice(vs));
}

fn push_f32s(out: &mut Vec<u8>, vs: &[f32]) {
    out.extend_from_slice(bytemuck::cast_slice(vs));
}

/// Encode a mesh in the selected format.
pub fn encode_mesh(mesh: &TriangleMesh, format: MeshOutputFormat) -> Vec<u8> {
    match format {
        MeshOutputFormat::Ply => encode_ply(mesh),
        MeshOutputFormat::Bobj => encode_bobj(mesh),
    }
}

/// Binary little-endian PLY with float vertices and uchar-counted
/// integer faces.
pub fn encode_ply(mesh: &TriangleMesh) -> Vec<u8> {
    let header = format!(
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         element face {}\nproperty list uchar int vertex_index\nend_header\n",
        mesh.vertex_count(),
        mesh.triangle_count()
    );

    let mut out = header.into_bytes();
    push_vec3s(&mut out, &mesh.vertices);
    for t in &mesh.triangles {
        out.push(3u8);
        for &idx in t {
            out.extend_from_slice(&(idx as i32).to_le_bytes());
        }
    }
    out
}

/// BOBJ: `u32` vertex count, raw vertex floats, `u32` triangle count,
/// raw index triples.
pub fn encode_bobj(mesh: &TriangleMesh) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + mesh.vertex_count() * 12 + mesh.triangle_count() * 12);
    push_u32(&mut out, mesh.vertex_count() as u32);
    push_vec3s(&mut out, &mesh.vertices);
    push_u32(&mut out, mesh.triangle_count() as u32);
    for t in &mesh.triangles {
        for &idx in t {
            push_u32(&mut out, idx);
        }
    }
    out
}

/// WWP: length-prefixed position stream.
pub fn encode_vector_stream(values: &[Vec3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len() * 12);
    push_u32(&mut out, values.len() as u32);
    push_vec3s(&mut out, values);
    out
}

/// WWF: length-prefixed float stream (lifetimes, speeds, ...).
pub fn encode_float_stream(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len() * 4);
    push_u32(&mut out, values.len() as u32);
    push_f32s(&mut out, values);
    out
}

/// WWI: length-prefixed byte stream (whitewater IDs).
pub fn encode_byte_stream(values: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len());
    push_u32(&mut out, values.len() as u32);
    out.extend_from_slice(values);
    out
}

/// Length-prefixed int stream (source IDs).
pub fn encode_int_stream(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len() * 4);
    push_u32(&mut out, values.len() as u32);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// One classified fluid-particle bucket before FFP3 encoding.
pub struct FluidParticleBucket {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub ids: Vec<u16>,
}

impl FluidParticleBucket {
    pub fn new() -> Self {
        Self {
            positions: Vec::new(),
            velocities: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// Sort the bucket by particle ID (stable), enabling deterministic
    /// truncation by an ID limit.
    pub fn sort_by_id(&mut self) {
        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        order.sort_by_key(|&i| (self.ids[i], i));
        self.positions = order.iter().map(|&i| self.positions[i]).collect();
        self.velocities = order.iter().map(|&i| self.velocities[i]).collect();
        self.ids = order.iter().map(|&i| self.ids[i]).collect();
    }

    /// Keep only particles with `id < id_limit`.
    pub fn truncate_by_id(&mut self, id_limit: u16) {
        let keep = self.ids.partition_point(|&id| id < id_limit);
        self.positions.truncate(keep);
        self.velocities.truncate(keep);
        self.ids.truncate(keep);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Default for FluidParticleBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// FFP3: `u32` counts for the surface/boundary/interior buckets, then
/// each bucket's positions, velocities, and `u16` IDs in order.
pub fn encode_ffp3(
    surface: &FluidParticleBucket,
    boundary: &FluidParticleBucket,
    interior: &FluidParticleBucket,
) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, surface.len() as u32);
    push_u32(&mut out, boundary.len() as u32);
    push_u32(&mut out, interior.len() as u32);
    for bucket in [surface, boundary, interior] {
        push_vec3s(&mut out, &bucket.positions);
        push_vec3s(&mut out, &bucket.velocities);
        for &id in &bucket.ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
    }
    out
}

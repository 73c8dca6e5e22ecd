//! Frame output: surface meshing and attribute/particle byte buffers.
//!
//! The output stage consumes an [`OutputSnapshot`] moved off the main
//! thread at the first substep of a frame. Everything here reads only
//! the snapshot, so it can run concurrently with later substeps.

use std::collections::HashMap;

use glam::Vec3;

use crate::array3d::{extrapolate_layers, Array3d};
use crate::formats::{
    encode_byte_stream, encode_ffp3, encode_float_stream, encode_int_stream, encode_mesh,
    encode_vector_stream, FluidParticleBucket, MeshOutputFormat,
};
use crate::grid::MacVelocityField;
use crate::levelset::ParticleLevelSet;
use crate::mesh::Aabb;
use crate::mesher::ParticleMesher;
use crate::transfer::transfer_attribute_to_grid;
use crate::whitewater::WhitewaterType;

/// Surface meshing configuration captured into the snapshot.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MeshingParams {
    pub subdivision_level: usize,
    pub num_polygonizer_slices: usize,
    pub smoothing_value: f32,
    pub smoothing_iterations: usize,
    pub min_polyhedron_triangle_count: usize,
    pub remove_surface_near_domain: bool,
    /// Distance from the boundary, in cells, below which triangles are
    /// discarded.
    pub remove_surface_near_domain_distance: usize,
    pub inverted_contact_normals: bool,
    /// Contact distance in units of `dx`.
    pub contact_threshold_distance: f32,
    pub obstacle_meshing_offset_enabled: bool,
    pub obstacle_meshing_offset: f32,
    pub preview_enabled: bool,
    pub preview_dx: f32,
    pub output_format: MeshOutputFormat,
    /// Optional meshing volume: output is culled to this region.
    pub meshing_volume: Option<Aabb>,
}

impl Default for MeshingParams {
    fn default() -> Self {
        Self {
            subdivision_level: 1,
            num_polygonizer_slices: 1,
            smoothing_value: 0.5,
            smoothing_iterations: 2,
            min_polyhedron_triangle_count: 0,
            remove_surface_near_domain: false,
            remove_surface_near_domain_distance: 0,
            inverted_contact_normals: false,
            contact_threshold_distance: 1.0,
            obstacle_meshing_offset_enabled: true,
            obstacle_meshing_offset: 0.0,
            preview_enabled: false,
            preview_dx: 0.0,
            output_format: MeshOutputFormat::Bobj,
            meshing_volume: None,
        }
    }
}

/// Which per-vertex surface attribute streams to produce.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SurfaceAttributeParams {
    pub velocity: bool,
    pub speed: bool,
    pub vorticity: bool,
    pub motion_blur: bool,
    pub age: bool,
    pub age_radius: f32,
    pub lifetime: bool,
    pub lifetime_radius: f32,
    pub whitewater_proximity: bool,
    pub whitewater_proximity_radius: f32,
    pub color: bool,
    pub color_radius: f32,
    /// HSV saturation boost factor applied to interpolated colors.
    pub color_saturation_factor: f32,
    pub source_id: bool,
    pub viscosity: bool,
    pub viscosity_radius: f32,
}

/// Whitewater output configuration.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct WhitewaterOutputParams {
    pub enabled: bool,
    /// One interleaved buffer instead of four per-type buffers.
    pub interleaved: bool,
    pub velocity: bool,
    pub id: bool,
    pub lifetime: bool,
    pub motion_blur: bool,
}

/// Fluid-particle output configuration.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FluidParticleOutputParams {
    pub enabled: bool,
    /// Fraction of particles kept, selected by ID bins.
    pub output_amount: f32,
}

/// Whitewater population copied into the snapshot.
#[derive(Clone, Default)]
pub struct WhitewaterSnapshot {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub types: Vec<WhitewaterType>,
    pub lifetimes: Vec<f32>,
    pub ids: Vec<u8>,
}

/// Everything the output worker needs, moved (not shared).
pub struct OutputSnapshot {
    pub frame: u32,
    pub frame_dt: f32,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub cell_size: f32,
    pub particle_radius: f32,

    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub ids: Option<Vec<u16>>,
    pub ages: Option<Vec<f32>>,
    pub lifetimes: Option<Vec<f32>>,
    pub colors: Option<Vec<Vec3>>,
    pub source_ids: Option<Vec<i32>>,
    pub viscosities: Option<Vec<f32>>,

    /// MAC field snapshot for motion blur and velocity attributes.
    pub velocity_field: MacVelocityField,
    /// Nodal solid distances for contact tests.
    pub solid_phi: Array3d<f32>,
    pub whitewater: WhitewaterSnapshot,

    pub meshing: MeshingParams,
    pub surface_attributes: SurfaceAttributeParams,
    pub whitewater_output: WhitewaterOutputParams,
    pub fluid_particle_output: FluidParticleOutputParams,
}

/// Byte buffers and counts produced for one frame.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffers {
    pub surface_mesh: Vec<u8>,
    pub preview_mesh: Vec<u8>,
    pub motion_blur: Vec<u8>,
    pub surface_velocity: Vec<u8>,
    pub surface_speed: Vec<u8>,
    pub surface_vorticity: Vec<u8>,
    pub surface_age: Vec<u8>,
    pub surface_lifetime: Vec<u8>,
    pub surface_whitewater_proximity: Vec<u8>,
    pub surface_color: Vec<u8>,
    pub surface_source_id: Vec<u8>,
    pub surface_viscosity: Vec<u8>,
    pub whitewater_foam: Vec<u8>,
    pub whitewater_bubble: Vec<u8>,
    pub whitewater_spray: Vec<u8>,
    pub whitewater_dust: Vec<u8>,
    pub whitewater_velocity: Vec<u8>,
    pub whitewater_id: Vec<u8>,
    pub whitewater_lifetime: Vec<u8>,
    pub fluid_particles: Vec<u8>,
    pub debug: Vec<u8>,

    pub surface_vertex_count: usize,
    pub surface_triangle_count: usize,
    pub fluid_particle_count: usize,
    pub whitewater_count: usize,
}

impl OutputBuffers {
    /// Total encoded byte size across all buffers.
    pub fn total_bytes(&self) -> usize {
        self.surface_mesh.len()
            + self.preview_mesh.len()
            + self.motion_blur.len()
            + self.surface_velocity.len()
            + self.surface_speed.len()
            + self.surface_vorticity.len()
            + self.surface_age.len()
            + self.surface_lifetime.len()
            + self.surface_whitewater_proximity.len()
            + self.surface_color.len()
            + self.surface_source_id.len()
            + self.surface_viscosity.len()
            + self.whitewater_foam.len()
            + self.whitewater_bubble.len()
            + self.whitewater_spray.len()
            + self.whitewater_dust.len()
            + self.whitewater_velocity.len()
            + self.whitewater_id.len()
            + self.whitewater_lifetime.len()
            + self.fluid_particles.len()
            + self.debug.len()
    }
}

/// Produce all frame output from a snapshot. Pure with respect to the
/// snapshot: the same snapshot always encodes identical buffers.
pub fn produce_output(snapshot: &OutputSnapshot, mesher: &dyn ParticleMesher) -> OutputBuffers {
    let mut out = OutputBuffers::default();

    let surface_sdf = build_meshing_sdf(snapshot, snapshot.cell_size);
    let mut surface = mesher.mesh_surface(
        &surface_sdf.phi,
        snapshot.cell_size,
        snapshot.meshing.subdivision_level,
        snapshot.meshing.num_polygonizer_slices,
    );

    surface.smooth(
        snapshot.meshing.smoothing_value,
        snapshot.meshing.smoothing_iterations,
    );
    surface.remove_small_components(snapshot.meshing.min_polyhedron_triangle_count);

    if snapshot.meshing.remove_surface_near_domain {
        remove_triangles_near_domain(snapshot, &mut surface);
    }
    if snapshot.meshing.inverted_contact_normals {
        flip_contact_triangles(snapshot, &mut surface);
    }

    out.surface_vertex_count = surface.vertex_count();
    out.surface_triangle_count = surface.triangle_count();
    out.surface_mesh = encode_mesh(&surface, snapshot.meshing.output_format);

    if snapshot.meshing.preview_enabled && snapshot.meshing.preview_dx > 0.0 {
        let preview_sdf = build_preview_sdf(snapshot);
        let preview = mesher.mesh_surface(&preview_sdf.phi, snapshot.meshing.preview_dx, 1, 1);
        out.preview_mesh = encode_mesh(&preview, snapshot.meshing.output_format);
    }

    produce_surface_attributes(snapshot, &surface, &mut out);
    produce_fluid_particles(snapshot, &mut out);
    produce_whitewater(snapshot, &mut out);

    out
}

/// Liquid SDF at output resolution, clipped to the meshing volume and
/// offset into obstacles.
fn build_meshing_sdf(snapshot: &OutputSnapshot, dx: f32) -> ParticleLevelSet {
    let mut sdf = ParticleLevelSet::new(snapshot.width, snapshot.height, snapshot.depth, dx);
    sdf.calculate_from_particles(&snapshot.positions, snapshot.particle_radius);

    if let Some(volume) = snapshot.meshing.meshing_volume {
        for k in 0..sdf.depth {
            for j in 0..sdf.height {
                for i in 0..sdf.width {
                    let center = Vec3::new(
                        (i as f32 + 0.5) * dx,
                        (j as f32 + 0.5) * dx,
                        (k as f32 + 0.5) * dx,
                    );
                    if !volume.contains(center) {
                        sdf.phi.set(i, j, k, 3.0 * dx);
                    }
                }
            }
        }
    }

    if snapshot.meshing.obstacle_meshing_offset_enabled {
        let offset = snapshot.meshing.obstacle_meshing_offset * snapshot.cell_size;
        for k in 0..sdf.depth {
            for j in 0..sdf.height {
                for i in 0..sdf.width {
                    let center = Vec3::new(
                        (i as f32 + 0.5) * dx,
                        (j as f32 + 0.5) * dx,
                        (k as f32 + 0.5) * dx,
                    );
                    let solid = snapshot
                        .solid_phi
                        .interpolate_node(center, snapshot.cell_size);
                    // Cull liquid that sits deeper into solid than the
                    // meshing offset allows
                    let clip = -solid - offset;
                    if clip > sdf.phi.get(i, j, k) {
                        sdf.phi.set(i, j, k, clip);
                    }
                }
            }
        }
    }

    sdf
}

fn build_preview_sdf(snapshot: &OutputSnapshot) -> ParticleLevelSet {
    let dx = snapshot.meshing.preview_dx;
    let width = ((snapshot.width as f32 * snapshot.cell_size) / dx).ceil() as usize;
    let height = ((snapshot.height as f32 * snapshot.cell_size) / dx).ceil() as usize;
    let depth = ((snapshot.depth as f32 * snapshot.cell_size) / dx).ceil() as usize;
    let mut sdf = ParticleLevelSet::new(width.max(1), height.max(1), depth.max(1), dx);
    sdf.calculate_from_particles(&snapshot.positions, snapshot.particle_radius.max(0.5 * dx));
    sdf
}

fn remove_triangles_near_domain(snapshot: &OutputSnapshot, mesh: &mut crate::mesh::TriangleMesh) {
    let dx = snapshot.cell_size;
    let distance = snapshot.meshing.remove_surface_near_domain_distance as f32 * dx;
    let min = Vec3::splat(distance);
    let max = Vec3::new(
        snapshot.width as f32 * dx - distance,
        snapshot.height as f32 * dx - distance,
        snapshot.depth as f32 * dx - distance,
    );

    let mask: Vec<bool> = (0..mesh.triangle_count())
        .map(|t| {
            let c = mesh.triangle_centroid(t);
            !(c.cmpgt(min).all() && c.cmplt(max).all())
        })
        .collect();
    if mask.iter().any(|&m| m) {
        mesh.remove_triangles(&mask);
    }
}

fn flip_contact_triangles(snapshot: &OutputSnapshot, mesh: &mut crate::mesh::TriangleMesh) {
    let threshold = snapshot.meshing.contact_threshold_distance * snapshot.cell_size;
    let mask: Vec<bool> = mesh
        .triangles
        .iter()
        .map(|t| {
            t.iter().any(|&v| {
                snapshot
                    .solid_phi
                    .interpolate_node(mesh.vertices[v as usize], snapshot.cell_size)
                    < threshold
            })
        })
        .collect();
    mesh.flip_triangles(&mask);
}

// ========== Surface attributes ==========

fn produce_surface_attributes(
    snapshot: &OutputSnapshot,
    surface: &crate::mesh::TriangleMesh,
    out: &mut OutputBuffers,
) {
    let attrs = &snapshot.surface_attributes;
    let field = &snapshot.velocity_field;

    if attrs.velocity || attrs.speed || attrs.motion_blur {
        let velocities: Vec<Vec3> = surface
            .vertices
            .iter()
            .map(|&v| field.velocity_at(v))
            .collect();
        if attrs.velocity {
            out.surface_velocity = encode_vector_stream(&velocities);
        }
        if attrs.speed {
            let speeds: Vec<f32> = velocities.iter().map(|v| v.length()).collect();
            out.surface_speed = encode_float_stream(&speeds);
        }
        if attrs.motion_blur {
            let offsets: Vec<Vec3> = velocities
                .iter()
                .map(|&v| v * snapshot.frame_dt)
                .collect();
            out.motion_blur = encode_vector_stream(&offsets);
        }
    }

    if attrs.vorticity {
        let curl = field.generate_curl_grid();
        let values: Vec<f32> = surface
            .vertices
            .iter()
            .map(|&v| curl.interpolate_cell_centered(v, snapshot.cell_size))
            .collect();
        out.surface_vorticity = encode_float_stream(&values);
    }

    if attrs.age {
        if let Some(ages) = &snapshot.ages {
            out.surface_age = encode_float_stream(&scalar_attribute_at_vertices(
                snapshot,
                surface,
                ages,
                attrs.age_radius,
            ));
        }
    }
    if attrs.lifetime {
        if let Some(lifetimes) = &snapshot.lifetimes {
            out.surface_lifetime = encode_float_stream(&scalar_attribute_at_vertices(
                snapshot,
                surface,
                lifetimes,
                attrs.lifetime_radius,
            ));
        }
    }
    if attrs.viscosity {
        if let Some(viscosities) = &snapshot.viscosities {
            out.surface_viscosity = encode_float_stream(&scalar_attribute_at_vertices(
                snapshot,
                surface,
                viscosities,
                attrs.viscosity_radius,
            ));
        }
    }

    if attrs.color {
        if let Some(colors) = &snapshot.colors {
            let channels: Vec<Vec<f32>> = (0..3)
                .map(|axis| {
                    let channel: Vec<f32> = colors.iter().map(|c| c[axis]).collect();
                    scalar_attribute_at_vertices(snapshot, surface, &channel, attrs.color_radius)
                })
                .collect();
            let mut values: Vec<Vec3> = (0..surface.vertex_count())
                .map(|v| Vec3::new(channels[0][v], channels[1][v], channels[2][v]))
                .collect();
            if attrs.color_saturation_factor > 0.0 {
                for c in &mut values {
                    *c = boost_saturation(*c, attrs.color_saturation_factor);
                }
            }
            out.surface_color = encode_vector_stream(&values);
        }
    }

    if attrs.whitewater_proximity {
        out.surface_whitewater_proximity =
            encode_vector_stream(&whitewater_proximity_at_vertices(snapshot, surface));
    }

    if attrs.source_id {
        if let Some(source_ids) = &snapshot.source_ids {
            out.surface_source_id =
                encode_int_stream(&source_id_at_vertices(snapshot, surface, source_ids));
        }
    }
}

/// Splat a per-particle scalar onto the grid, extrapolate a few layers,
/// and sample it at the mesh vertices.
fn scalar_attribute_at_vertices(
    snapshot: &OutputSnapshot,
    surface: &crate::mesh::TriangleMesh,
    values: &[f32],
    radius: f32,
) -> Vec<f32> {
    let dx = snapshot.cell_size;
    let radius = if radius > 0.0 { radius } else { 2.0 * dx };
    let mut grid = Array3d::new(snapshot.width, snapshot.height, snapshot.depth, 0.0f32);
    let mut valid = Array3d::new(snapshot.width, snapshot.height, snapshot.depth, false);
    transfer_attribute_to_grid(&snapshot.positions, values, radius, dx, &mut grid, &mut valid);
    extrapolate_layers(&mut grid, &mut valid, 3);

    surface
        .vertices
        .iter()
        .map(|&v| grid.interpolate_cell_centered(v, dx))
        .collect()
}

/// Per-vertex (foam, bubble, spray) whitewater counts within the
/// configured radius.
fn whitewater_proximity_at_vertices(
    snapshot: &OutputSnapshot,
    surface: &crate::mesh::TriangleMesh,
) -> Vec<Vec3> {
    let dx = snapshot.cell_size;
    let radius = if snapshot.surface_attributes.whitewater_proximity_radius > 0.0 {
        snapshot.surface_attributes.whitewater_proximity_radius
    } else {
        2.0 * dx
    };
    let r2 = radius * radius;

    // Bin whitewater by cell for the neighbourhood search
    let mut bins: HashMap<(i32, i32, i32), Vec<usize>> = HashMap::new();
    for (idx, p) in snapshot.whitewater.positions.iter().enumerate() {
        let key = (
            (p.x / radius).floor() as i32,
            (p.y / radius).floor() as i32,
            (p.z / radius).floor() as i32,
        );
        bins.entry(key).or_default().push(idx);
    }

    surface
        .vertices
        .iter()
        .map(|&v| {
            let key = (
                (v.x / radius).floor() as i32,
                (v.y / radius).floor() as i32,
                (v.z / radius).floor() as i32,
            );
            let mut counts = Vec3::ZERO;
            for dk in -1..=1 {
                for dj in -1..=1 {
                    for di in -1..=1 {
                        let Some(indices) = bins.get(&(key.0 + di, key.1 + dj, key.2 + dk))
                        else {
                            continue;
                        };
                        for &idx in indices {
                            if (snapshot.whitewater.positions[idx] - v).length_squared() < r2 {
                                match snapshot.whitewater.types[idx] {
                                    WhitewaterType::Foam => counts.x += 1.0,
                                    WhitewaterType::Bubble => counts.y += 1.0,
                                    WhitewaterType::Spray => counts.z += 1.0,
                                    WhitewaterType::Dust => counts.y += 1.0,
                                }
                            }
                        }
                    }
                }
            }
            counts
        })
        .collect()
}

/// Nearest-particle source ID within a small cell neighbourhood.
fn source_id_at_vertices(
    snapshot: &OutputSnapshot,
    surface: &crate::mesh::TriangleMesh,
    source_ids: &[i32],
) -> Vec<i32> {
    let dx = snapshot.cell_size;
    let mut bins: HashMap<(i32, i32, i32), Vec<usize>> = HashMap::new();
    for (idx, p) in snapshot.positions.iter().enumerate() {
        let key = (
            (p.x / dx).floor() as i32,
            (p.y / dx).floor() as i32,
            (p.z / dx).floor() as i32,
        );
        bins.entry(key).or_default().push(idx);
    }

    surface
        .vertices
        .iter()
        .map(|&v| {
            let key = (
                (v.x / dx).floor() as i32,
                (v.y / dx).floor() as i32,
                (v.z / dx).floor() as i32,
            );
            let mut best = -1i32;
            let mut best_dist = f32::MAX;
            for dk in -1..=1 {
                for dj in -1..=1 {
                    for di in -1..=1 {
                        let Some(indices) = bins.get(&(key.0 + di, key.1 + dj, key.2 + dk))
                        else {
                            continue;
                        };
                        for &idx in indices {
                            let d = (snapshot.positions[idx] - v).length_squared();
                            if d < best_dist {
                                best_dist = d;
                                best = source_ids[idx];
                            }
                        }
                    }
                }
            }
            best
        })
        .collect()
}

/// Lift HSV saturation by `factor`, preserving hue and value.
fn boost_saturation(rgb: Vec3, factor: f32) -> Vec3 {
    let max = rgb.max_element();
    let min = rgb.min_element();
    if max <= 0.0 || max - min <= 0.0 {
        return rgb;
    }
    let saturation = ((max - min) / max * factor).clamp(0.0, 1.0);
    let scale = saturation * max / (max - min);
    Vec3::new(
        max - (max - rgb.x) * scale,
        max - (max - rgb.y) * scale,
        max - (max - rgb.z) * scale,
    )
}

// ========== Fluid particles ==========

fn produce_fluid_particles(snapshot: &OutputSnapshot, out: &mut OutputBuffers) {
    let params = &snapshot.fluid_particle_output;
    if !params.enabled {
        return;
    }

    let dx = snapshot.cell_size;
    let liquid = {
        let mut sdf = ParticleLevelSet::new(snapshot.width, snapshot.height, snapshot.depth, dx);
        sdf.calculate_from_particles(&snapshot.positions, snapshot.particle_radius);
        sdf
    };

    let domain_max = Vec3::new(
        snapshot.width as f32 * dx,
        snapshot.height as f32 * dx,
        snapshot.depth as f32 * dx,
    );

    let mut surface = FluidParticleBucket::new();
    let mut boundary = FluidParticleBucket::new();
    let mut interior = FluidParticleBucket::new();

    for (idx, &p) in snapshot.positions.iter().enumerate() {
        let id = snapshot.ids.as_ref().map(|ids| ids[idx]).unwrap_or(0);
        let velocity = snapshot.velocities[idx];

        let near_boundary = p.x < 2.0 * dx
            || p.y < 2.0 * dx
            || p.z < 2.0 * dx
            || p.x > domain_max.x - 2.0 * dx
            || p.y > domain_max.y - 2.0 * dx
            || p.z > domain_max.z - 2.0 * dx
            || snapshot.solid_phi.interpolate_node(p, dx) < 2.0 * dx;

        // A particle is at the surface when any cell around its own is
        // not fluid
        let ci = (p.x / dx).floor() as i32;
        let cj = (p.y / dx).floor() as i32;
        let ck = (p.z / dx).floor() as i32;
        let mut near_surface = false;
        'scan: for dk in -1..=1 {
            for dj in -1..=1 {
                for di in -1..=1 {
                    if liquid.get_signed(ci + di, cj + dj, ck + dk) >= 0.0 {
                        near_surface = true;
                        break 'scan;
                    }
                }
            }
        }

        let bucket = if near_surface {
            &mut surface
        } else if near_boundary {
            &mut boundary
        } else {
            &mut interior
        };
        bucket.positions.push(p);
        bucket.velocities.push(velocity);
        bucket.ids.push(id);
    }

    let id_limit = (params.output_amount.clamp(0.0, 1.0) * 65536.0) as u32;
    let id_limit = id_limit.min(65535) as u16;
    for bucket in [&mut surface, &mut boundary, &mut interior] {
        bucket.sort_by_id();
        if params.output_amount < 1.0 {
            bucket.truncate_by_id(id_limit);
        }
    }

    out.fluid_particle_count = surface.len() + boundary.len() + interior.len();
    out.fluid_particles = encode_ffp3(&surface, &boundary, &interior);
}

// ========== Whitewater ==========

fn produce_whitewater(snapshot: &OutputSnapshot, out: &mut OutputBuffers) {
    let params = &snapshot.whitewater_output;
    if !params.enabled {
        return;
    }

    let ww = &snapshot.whitewater;
    out.whitewater_count = ww.positions.len();

    if params.interleaved {
        out.whitewater_foam = encode_vector_stream(&ww.positions);
    } else {
        for (kind, buffer) in [
            (WhitewaterType::Foam, &mut out.whitewater_foam),
            (WhitewaterType::Bubble, &mut out.whitewater_bubble),
            (WhitewaterType::Spray, &mut out.whitewater_spray),
            (WhitewaterType::Dust, &mut out.whitewater_dust),
        ] {
            let positions: Vec<Vec3> = ww
                .positions
                .iter()
                .zip(&ww.types)
                .filter(|(_, &t)| t == kind)
                .map(|(&p, _)| p)
                .collect();
            *buffer = encode_vector_stream(&positions);
        }
    }

    if params.velocity {
        out.whitewater_velocity = encode_vector_stream(&ww.velocities);
    }
    if params.id {
        out.whitewater_id = encode_byte_stream(&ww.ids);
    }
    if params.lifetime {
        out.whitewater_lifetime = encode_float_stream(&ww.lifetimes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesher::SurfaceNetsMesher;

    fn pool_snapshot(n: usize, dx: f32) -> OutputSnapshot {
        let mut positions = Vec::new();
        for k in 1..n - 1 {
            for j in 1..n / 2 {
                for i in 1..n - 1 {
                    for octant in 0..8 {
                        let offset = Vec3::new(
                            if octant & 1 == 0 { -0.25 } else { 0.25 },
                            if octant & 2 == 0 { -0.25 } else { 0.25 },
                            if octant & 4 == 0 { -0.25 } else { 0.25 },
                        ) * dx;
                        positions.push(
                            Vec3::new(
                                (i as f32 + 0.5) * dx,
                                (j as f32 + 0.5) * dx,
                                (k as f32 + 0.5) * dx,
                            ) + offset,
                        );
                    }
                }
            }
        }
        let count = positions.len();
        OutputSnapshot {
            frame: 0,
            frame_dt: 1.0 / 30.0,
            width: n,
            height: n,
            depth: n,
            cell_size: dx,
            particle_radius: 0.6 * dx,
            velocities: vec![Vec3::ZERO; count],
            ids: Some((0..count).map(|i| ((i * 997) % 65536) as u16).collect()),
            ages: None,
            lifetimes: None,
            colors: None,
            source_ids: None,
            viscosities: None,
            positions,
            velocity_field: MacVelocityField::new(n, n, n, dx),
            solid_phi: Array3d::new(n + 1, n + 1, n + 1, 10.0),
            whitewater: WhitewaterSnapshot::default(),
            meshing: MeshingParams::default(),
            surface_attributes: SurfaceAttributeParams::default(),
            whitewater_output: WhitewaterOutputParams::default(),
            fluid_particle_output: FluidParticleOutputParams::default(),
        }
    }

    #[test]
    fn test_pool_produces_surface_mesh() {
        let snapshot = pool_snapshot(8, 0.5);
        let out = produce_output(&snapshot, &SurfaceNetsMesher);
        assert!(!out.surface_mesh.is_empty());
        assert!(out.surface_vertex_count > 0);
        assert!(out.surface_triangle_count > 0);
    }

    #[test]
    fn test_output_is_deterministic() {
        let snapshot = pool_snapshot(8, 0.5);
        let a = produce_output(&snapshot, &SurfaceNetsMesher);
        let b = produce_output(&snapshot, &SurfaceNetsMesher);
        assert_eq!(a.surface_mesh, b.surface_mesh);
        assert_eq!(a.fluid_particles, b.fluid_particles);
    }

    #[test]
    fn test_surface_attribute_streams_match_vertex_count() {
        let mut snapshot = pool_snapshot(8, 0.5);
        snapshot.surface_attributes.velocity = true;
        snapshot.surface_attributes.speed = true;
        let out = produce_output(&snapshot, &SurfaceNetsMesher);

        let n = out.surface_vertex_count as u32;
        assert_eq!(
            u32::from_le_bytes(out.surface_velocity[0..4].try_into().unwrap()),
            n
        );
        assert_eq!(
            u32::from_le_bytes(out.surface_speed[0..4].try_into().unwrap()),
            n
        );
    }

    #[test]
    fn test_fluid_particle_output_truncates_by_id() {
        let mut snapshot = pool_snapshot(8, 0.5);
        snapshot.fluid_particle_output.enabled = true;
        snapshot.fluid_particle_output.output_amount = 1.0;
        let full = produce_output(&snapshot, &SurfaceNetsMesher);
        assert_eq!(full.fluid_particle_count, snapshot.positions.len());

        snapshot.fluid_particle_output.output_amount = 0.25;
        let quarter = produce_output(&snapshot, &SurfaceNetsMesher);
        assert!(quarter.fluid_particle_count < full.fluid_particle_count);
        assert!(quarter.fluid_particle_count > 0);
    }

    #[test]
    fn test_whitewater_per_type_buffers() {
        let mut snapshot = pool_snapshot(8, 0.5);
        snapshot.whitewater_output.enabled = true;
        snapshot.whitewater_output.lifetime = true;
        snapshot.whitewater.positions = vec![Vec3::ONE, Vec3::splat(2.0)];
        snapshot.whitewater.velocities = vec![Vec3::ZERO; 2];
        snapshot.whitewater.types = vec![WhitewaterType::Foam, WhitewaterType::Spray];
        snapshot.whitewater.lifetimes = vec![1.0, 2.0];
        snapshot.whitewater.ids = vec![0, 1];

        let out = produce_output(&snapshot, &SurfaceNetsMesher);
        assert_eq!(
            u32::from_le_bytes(out.whitewater_foam[0..4].try_into().unwrap()),
            1
        );
        assert_eq!(
            u32::from_le_bytes(out.whitewater_spray[0..4].try_into().unwrap()),
            1
        );
        assert_eq!(
            u32::from_le_bytes(out.whitewater_bubble[0..4].try_into().unwrap()),
            0
        );
        assert_eq!(out.whitewater_lifetime.len(), 4 + 8);
    }

    #[test]
    fn test_near_domain_pruning_removes_everything_for_shallow_pool() {
        let mut snapshot = pool_snapshot(8, 0.5);
        snapshot.meshing.remove_surface_near_domain = true;
        snapshot.meshing.remove_surface_near_domain_distance = 4;
        let out = produce_output(&snapshot, &SurfaceNetsMesher);
        // A 4-cell margin on an 8-cell grid leaves no interior
        assert_eq!(out.surface_triangle_count, 0);
    }
}

//! Particle-grid transfer: P2G velocity splats (FLIP and APIC), the
//! valid-face mask, and G2P velocity updates.
//!
//! Each velocity component uses a trilinear hat kernel over the eight
//! surrounding face samples of its own staggered lattice. The splat is a
//! serial scatter (deterministic across thread counts); gathers run in
//! parallel over particles.

use glam::Vec3;
use rayon::prelude::*;

use crate::array3d::Array3d;
use crate::grid::{MacVelocityField, ValidVelocityGrid};
use crate::particles::{
    ParticleStore, ATTR_AFFINE_X, ATTR_AFFINE_Y, ATTR_AFFINE_Z, ATTR_POSITION, ATTR_VELOCITY,
};

/// How particle velocities move to and from the grid.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum VelocityTransferMethod {
    /// Incremental delta blend against a saved field snapshot.
    Flip,
    /// Affine particle-in-cell with per-particle velocity gradient rows.
    Apic,
}

const WEIGHT_EPSILON: f32 = 1e-9;

/// Per-component face offsets of the staggered lattices, in cell units.
const U_OFFSET: Vec3 = Vec3::new(0.0, 0.5, 0.5);
const V_OFFSET: Vec3 = Vec3::new(0.5, 0.0, 0.5);
const W_OFFSET: Vec3 = Vec3::new(0.5, 0.5, 0.0);

/// Pre-allocated accumulation buffers for the P2G splat.
pub struct TransferBuffers {
    u_sum: Array3d<f32>,
    u_weight: Array3d<f32>,
    v_sum: Array3d<f32>,
    v_weight: Array3d<f32>,
    w_sum: Array3d<f32>,
    w_weight: Array3d<f32>,
}

impl TransferBuffers {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            u_sum: Array3d::new(width + 1, height, depth, 0.0),
            u_weight: Array3d::new(width + 1, height, depth, 0.0),
            v_sum: Array3d::new(width, height + 1, depth, 0.0),
            v_weight: Array3d::new(width, height + 1, depth, 0.0),
            w_sum: Array3d::new(width, height, depth + 1, 0.0),
            w_weight: Array3d::new(width, height, depth + 1, 0.0),
        }
    }

    fn clear(&mut self) {
        self.u_sum.fill(0.0);
        self.u_weight.fill(0.0);
        self.v_sum.fill(0.0);
        self.v_weight.fill(0.0);
        self.w_sum.fill(0.0);
        self.w_weight.fill(0.0);
    }
}

/// Trilinear hat weights and base index for a position on a staggered
/// lattice. Returns the lattice cell's base index and the fractional
/// offset inside it.
#[inline]
fn lattice_coords(pos: Vec3, inv_dx: f32, offset: Vec3) -> (i32, i32, i32, Vec3) {
    let p = pos * inv_dx - offset;
    let base = p.floor();
    (base.x as i32, base.y as i32, base.z as i32, p - base)
}

#[inline]
fn hat_weight(t: Vec3, di: usize, dj: usize, dk: usize) -> f32 {
    let wx = if di == 0 { 1.0 - t.x } else { t.x };
    let wy = if dj == 0 { 1.0 - t.y } else { t.y };
    let wz = if dk == 0 { 1.0 - t.z } else { t.z };
    wx * wy * wz
}

/// Gradient of the trilinear hat weight with respect to the particle
/// position, in world units.
#[inline]
fn hat_weight_gradient(t: Vec3, di: usize, dj: usize, dk: usize, inv_dx: f32) -> Vec3 {
    let wx = if di == 0 { 1.0 - t.x } else { t.x };
    let wy = if dj == 0 { 1.0 - t.y } else { t.y };
    let wz = if dk == 0 { 1.0 - t.z } else { t.z };
    let dwx = if di == 0 { -1.0 } else { 1.0 };
    let dwy = if dj == 0 { -1.0 } else { 1.0 };
    let dwz = if dk == 0 { -1.0 } else { 1.0 };
    Vec3::new(dwx * wy * wz, wx * dwy * wz, wx * wy * dwz) * inv_dx
}

/// Splat particle velocities onto the grid faces and mark the faces
/// that received mass as valid.
pub fn transfer_particles_to_grid(
    field: &mut MacVelocityField,
    valid: &mut ValidVelocityGrid,
    particles: &ParticleStore,
    buffers: &mut TransferBuffers,
    method: VelocityTransferMethod,
) {
    buffers.clear();
    let inv_dx = 1.0 / field.cell_size;

    let positions = particles.vec3_values(ATTR_POSITION).expect("position column");
    let velocities = particles.vec3_values(ATTR_VELOCITY).expect("velocity column");

    let affine = if method == VelocityTransferMethod::Apic {
        Some((
            particles.vec3_values(ATTR_AFFINE_X).expect("affine x column"),
            particles.vec3_values(ATTR_AFFINE_Y).expect("affine y column"),
            particles.vec3_values(ATTR_AFFINE_Z).expect("affine z column"),
        ))
    } else {
        None
    };

    for p in 0..particles.len() {
        let pos = positions[p];
        let vel = velocities[p];
        let affine_rows = affine.map(|(ax, ay, az)| (ax[p], ay[p], az[p]));

        splat_component(
            &mut buffers.u_sum,
            &mut buffers.u_weight,
            pos,
            vel.x,
            affine_rows.map(|rows| rows.0),
            U_OFFSET,
            field.cell_size,
            inv_dx,
        );
        splat_component(
            &mut buffers.v_sum,
            &mut buffers.v_weight,
            pos,
            vel.y,
            affine_rows.map(|rows| rows.1),
            V_OFFSET,
            field.cell_size,
            inv_dx,
        );
        splat_component(
            &mut buffers.w_sum,
            &mut buffers.w_weight,
            pos,
            vel.z,
            affine_rows.map(|rows| rows.2),
            W_OFFSET,
            field.cell_size,
            inv_dx,
        );
    }

    normalize_component(&mut field.u, &mut valid.u, &buffers.u_sum, &buffers.u_weight);
    normalize_component(&mut field.v, &mut valid.v, &buffers.v_sum, &buffers.v_weight);
    normalize_component(&mut field.w, &mut valid.w, &buffers.w_sum, &buffers.w_weight);
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn splat_component(
    sums: &mut Array3d<f32>,
    weights: &mut Array3d<f32>,
    pos: Vec3,
    velocity_component: f32,
    affine_row: Option<Vec3>,
    offset: Vec3,
    dx: f32,
    inv_dx: f32,
) {
    let (bi, bj, bk, t) = lattice_coords(pos, inv_dx, offset);

    for dk in 0..2usize {
        for dj in 0..2usize {
            for di in 0..2usize {
                let ni = bi + di as i32;
                let nj = bj + dj as i32;
                let nk = bk + dk as i32;
                if !sums.in_bounds(ni, nj, nk) {
                    continue;
                }

                let w = hat_weight(t, di, dj, dk);
                if w < WEIGHT_EPSILON {
                    continue;
                }

                let mut value = velocity_component;
                if let Some(row) = affine_row {
                    let face_pos = Vec3::new(
                        (ni as f32 + offset.x) * dx,
                        (nj as f32 + offset.y) * dx,
                        (nk as f32 + offset.z) * dx,
                    );
                    value += row.dot(face_pos - pos);
                }

                let idx = sums.index(ni as usize, nj as usize, nk as usize);
                sums.data_mut()[idx] += value * w;
                weights.data_mut()[idx] += w;
            }
        }
    }
}

fn normalize_component(
    out: &mut Array3d<f32>,
    valid: &mut Array3d<bool>,
    sums: &Array3d<f32>,
    weights: &Array3d<f32>,
) {
    out.data_mut()
        .par_iter_mut()
        .zip(valid.data_mut().par_iter_mut())
        .zip(sums.data().par_iter().zip(weights.data().par_iter()))
        .for_each(|((v, is_valid), (&sum, &weight))| {
            if weight > WEIGHT_EPSILON {
                *v = sum / weight;
                *is_valid = true;
            } else {
                *v = 0.0;
                *is_valid = false;
            }
        });
}

/// Gather one component of the field with trilinear hat weights.
#[inline]
fn sample_component(field: &Array3d<f32>, pos: Vec3, inv_dx: f32, offset: Vec3) -> f32 {
    let (bi, bj, bk, t) = lattice_coords(pos, inv_dx, offset);
    let mut sum = 0.0;
    for dk in 0..2usize {
        for dj in 0..2usize {
            for di in 0..2usize {
                let w = hat_weight(t, di, dj, dk);
                sum += w * field.get_clamped(bi + di as i32, bj + dj as i32, bk + dk as i32);
            }
        }
    }
    sum
}

/// Gather one component's gradient-weighted sum, producing an affine
/// matrix row (the velocity gradient of that component).
#[inline]
fn sample_component_gradient(
    field: &Array3d<f32>,
    pos: Vec3,
    inv_dx: f32,
    offset: Vec3,
) -> Vec3 {
    let (bi, bj, bk, t) = lattice_coords(pos, inv_dx, offset);
    let mut row = Vec3::ZERO;
    for dk in 0..2usize {
        for dj in 0..2usize {
            for di in 0..2usize {
                let grad = hat_weight_gradient(t, di, dj, dk, inv_dx);
                row += grad * field.get_clamped(bi + di as i32, bj + dj as i32, bk + dk as i32);
            }
        }
    }
    row
}

/// Update particle velocities from the grid.
///
/// FLIP: `v = ratio * v_grid + (1 - ratio) * (v_old + (v_grid - v_saved))`
/// where `ratio` is the PIC fraction (`ratio = 1` is pure PIC).
///
/// APIC: velocity is the grid interpolation; the affine rows are rebuilt
/// from the trilinear basis gradients.
pub fn transfer_grid_to_particles(
    field: &MacVelocityField,
    saved_field: &MacVelocityField,
    particles: &mut ParticleStore,
    method: VelocityTransferMethod,
    pic_ratio: f32,
) {
    let inv_dx = 1.0 / field.cell_size;
    let count = particles.len();

    match method {
        VelocityTransferMethod::Flip => {
            // Split borrow: positions are read-only while velocities mutate
            let (positions, velocities) = particles
                .two_vec3_values_mut(ATTR_POSITION, ATTR_VELOCITY)
                .expect("position/velocity columns");

            positions[..count]
                .par_iter()
                .zip(velocities[..count].par_iter_mut())
                .for_each(|(&pos, vel)| {
                    let v_grid = Vec3::new(
                        sample_component(&field.u, pos, inv_dx, U_OFFSET),
                        sample_component(&field.v, pos, inv_dx, V_OFFSET),
                        sample_component(&field.w, pos, inv_dx, W_OFFSET),
                    );
                    let v_saved = Vec3::new(
                        sample_component(&saved_field.u, pos, inv_dx, U_OFFSET),
                        sample_component(&saved_field.v, pos, inv_dx, V_OFFSET),
                        sample_component(&saved_field.w, pos, inv_dx, W_OFFSET),
                    );

                    let flip_velocity = *vel + (v_grid - v_saved);
                    *vel = pic_ratio * v_grid + (1.0 - pic_ratio) * flip_velocity;
                });
        }
        VelocityTransferMethod::Apic => {
            let positions = particles
                .vec3_values(ATTR_POSITION)
                .expect("position column")
                .clone();

            let results: Vec<(Vec3, Vec3, Vec3, Vec3)> = positions[..count]
                .par_iter()
                .map(|&pos| {
                    let vel = Vec3::new(
                        sample_component(&field.u, pos, inv_dx, U_OFFSET),
                        sample_component(&field.v, pos, inv_dx, V_OFFSET),
                        sample_component(&field.w, pos, inv_dx, W_OFFSET),
                    );
                    let ax = sample_component_gradient(&field.u, pos, inv_dx, U_OFFSET);
                    let ay = sample_component_gradient(&field.v, pos, inv_dx, V_OFFSET);
                    let az = sample_component_gradient(&field.w, pos, inv_dx, W_OFFSET);
                    (vel, ax, ay, az)
                })
                .collect();

            let velocities = particles
                .vec3_values_mut(ATTR_VELOCITY)
                .expect("velocity column");
            for (v, r) in velocities.iter_mut().zip(&results) {
                *v = r.0;
            }
            let affine_x = particles
                .vec3_values_mut(ATTR_AFFINE_X)
                .expect("affine x column");
            for (a, r) in affine_x.iter_mut().zip(&results) {
                *a = r.1;
            }
            let affine_y = particles
                .vec3_values_mut(ATTR_AFFINE_Y)
                .expect("affine y column");
            for (a, r) in affine_y.iter_mut().zip(&results) {
                *a = r.2;
            }
            let affine_z = particles
                .vec3_values_mut(ATTR_AFFINE_Z)
                .expect("affine z column");
            for (a, r) in affine_z.iter_mut().zip(&results) {
                *a = r.3;
            }
        }
    }
}

/// Smooth radius kernel used for attribute splats: `(1 - (r/R)^2)^3`.
#[inline]
fn attribute_kernel(r_squared: f32, inv_radius_squared: f32) -> f32 {
    let q = 1.0 - r_squared * inv_radius_squared;
    if q <= 0.0 {
        0.0
    } else {
        q * q * q
    }
}

/// Splat a per-particle scalar onto a cell-centered grid with a radius
/// kernel, normalizing by total weight and marking covered cells valid.
pub fn transfer_attribute_to_grid(
    positions: &[Vec3],
    values: &[f32],
    radius: f32,
    dx: f32,
    grid: &mut Array3d<f32>,
    valid: &mut Array3d<bool>,
) {
    let mut weights = Array3d::new(grid.width, grid.height, grid.depth, 0.0f32);
    grid.fill(0.0);
    valid.fill(false);

    let inv_r2 = 1.0 / (radius * radius);
    let stencil = (radius / dx).ceil() as i32;

    for (&p, &value) in positions.iter().zip(values) {
        let ci = (p.x / dx - 0.5).floor() as i32;
        let cj = (p.y / dx - 0.5).floor() as i32;
        let ck = (p.z / dx - 0.5).floor() as i32;

        for k in (ck - stencil).max(0)..=(ck + stencil).min(grid.depth as i32 - 1) {
            for j in (cj - stencil).max(0)..=(cj + stencil).min(grid.height as i32 - 1) {
                for i in (ci - stencil).max(0)..=(ci + stencil).min(grid.width as i32 - 1) {
                    let center = Vec3::new(
                        (i as f32 + 0.5) * dx,
                        (j as f32 + 0.5) * dx,
                        (k as f32 + 0.5) * dx,
                    );
                    let w = attribute_kernel((center - p).length_squared(), inv_r2);
                    if w > 0.0 {
                        let idx = grid.index(i as usize, j as usize, k as usize);
                        grid.data_mut()[idx] += w * value;
                        weights.data_mut()[idx] += w;
                    }
                }
            }
        }
    }

    for idx in 0..grid.len() {
        let w = weights.data()[idx];
        if w > WEIGHT_EPSILON {
            grid.data_mut()[idx] /= w;
            valid.data_mut()[idx] = true;
        }
    }
}

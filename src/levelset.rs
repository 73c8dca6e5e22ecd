//! Signed distance fields: solid obstacles (from meshes) and liquid
//! (from marker particles).
//!
//! Solid SDFs are sampled at grid nodes, liquid SDFs at cell centers.
//! Negative values are inside the represented region.

use glam::Vec3;

use crate::array3d::Array3d;
use crate::mesh::{mesh_to_sdf, TriangleMesh};

/// Fraction of the segment between two samples that lies inside
/// (`phi < 0`).
pub fn fraction_inside(phi_left: f32, phi_right: f32) -> f32 {
    if phi_left < 0.0 && phi_right < 0.0 {
        1.0
    } else if phi_left < 0.0 && phi_right >= 0.0 {
        phi_left / (phi_left - phi_right)
    } else if phi_left >= 0.0 && phi_right < 0.0 {
        phi_right / (phi_right - phi_left)
    } else {
        0.0
    }
}

/// Fraction of a face area inside the zero isocontour, given the four
/// corner samples in (bottom-left, bottom-right, top-left, top-right)
/// order. Marching-squares case analysis after Batty's levelset utils.
pub fn fraction_inside_quad(phi_bl: f32, phi_br: f32, phi_tl: f32, phi_tr: f32) -> f32 {
    let inside_count = [phi_bl, phi_br, phi_tl, phi_tr]
        .iter()
        .filter(|&&p| p < 0.0)
        .count();
    // Cyclic corner order
    let mut list = [phi_bl, phi_br, phi_tr, phi_tl];

    fn cycle(list: &mut [f32; 4]) {
        let first = list[0];
        list.copy_within(1..4, 0);
        list[3] = first;
    }

    match inside_count {
        4 => 1.0,
        3 => {
            while list[0] < 0.0 {
                cycle(&mut list);
            }
            let side0 = 1.0 - fraction_inside(list[0], list[3]);
            let side1 = 1.0 - fraction_inside(list[0], list[1]);
            1.0 - 0.5 * side0 * side1
        }
        2 => {
            while list[0] >= 0.0 {
                cycle(&mut list);
            }
            if list[1] < 0.0 {
                // Inside corners are adjacent
                let side_left = fraction_inside(list[0], list[3]);
                let side_right = fraction_inside(list[1], list[2]);
                0.5 * (side_left + side_right)
            } else if list[2] < 0.0 {
                // Inside corners are diagonal; middle sample disambiguates
                let middle = 0.25 * (list[0] + list[1] + list[2] + list[3]);
                if middle < 0.0 {
                    let mut area = 0.0;
                    let side1 = 1.0 - fraction_inside(list[0], list[3]);
                    let side3 = 1.0 - fraction_inside(list[2], list[3]);
                    area += 0.5 * side1 * side3;
                    let side2 = 1.0 - fraction_inside(list[2], list[1]);
                    let side0 = 1.0 - fraction_inside(list[0], list[1]);
                    area += 0.5 * side0 * side2;
                    1.0 - area
                } else {
                    let mut area = 0.0;
                    let side0 = fraction_inside(list[0], list[1]);
                    let side1 = fraction_inside(list[0], list[3]);
                    area += 0.5 * side0 * side1;
                    let side2 = fraction_inside(list[2], list[1]);
                    let side3 = fraction_inside(list[2], list[3]);
                    area += 0.5 * side2 * side3;
                    area
                }
            } else {
                // list[3] < 0: rotate once more to make the pair adjacent
                cycle(&mut list);
                while list[0] >= 0.0 {
                    cycle(&mut list);
                }
                let side_left = fraction_inside(list[0], list[3]);
                let side_right = fraction_inside(list[1], list[2]);
                0.5 * (side_left + side_right)
            }
        }
        1 => {
            while list[0] >= 0.0 {
                cycle(&mut list);
            }
            let side0 = fraction_inside(list[0], list[1]);
            let side1 = fraction_inside(list[0], list[3]);
            0.5 * side0 * side1
        }
        _ => 0.0,
    }
}

/// Fraction of a tetrahedron's volume where the linearly interpolated
/// field is negative, from its four vertex samples.
///
/// Uses the simplex B-spline identity: the fraction below zero is
/// `sum_i max(0, -x_i)^3 / prod_{j != i} (x_j - x_i)`.
pub fn tet_fraction_inside(mut x: [f32; 4]) -> f32 {
    let min = x.iter().cloned().fold(f32::MAX, f32::min);
    let max = x.iter().cloned().fold(f32::MIN, f32::max);
    if min >= 0.0 {
        return 0.0;
    }
    if max <= 0.0 {
        return 1.0;
    }

    // Perturb ties so the divided differences stay finite
    for i in 0..4 {
        for j in (i + 1)..4 {
            if (x[i] - x[j]).abs() < 1e-7 {
                x[j] += 2e-7 * (j as f32);
            }
        }
    }

    let mut fraction = 0.0f32;
    for i in 0..4 {
        if x[i] >= 0.0 {
            continue;
        }
        let mut denom = 1.0f32;
        for j in 0..4 {
            if j != i {
                denom *= x[j] - x[i];
            }
        }
        fraction += (-x[i]).powi(3) / denom;
    }
    fraction.clamp(0.0, 1.0)
}

/// Fraction of a cube's volume inside the zero isocontour from its
/// eight corner samples, ordered `phi[k*4 + j*2 + i]`. The cube is
/// decomposed into six tetrahedra around the main diagonal.
pub fn cube_volume_fraction(phi: [f32; 8]) -> f32 {
    const TETS: [[usize; 4]; 6] = [
        [0, 1, 3, 7],
        [0, 3, 2, 7],
        [0, 2, 6, 7],
        [0, 6, 4, 7],
        [0, 4, 5, 7],
        [0, 5, 1, 7],
    ];
    let mut sum = 0.0;
    for t in TETS {
        sum += tet_fraction_inside([phi[t[0]], phi[t[1]], phi[t[2]], phi[t[3]]]);
    }
    sum / 6.0
}

/// Signed distance field computed from triangle meshes, sampled at grid
/// nodes, with optional solid-velocity samples and nearest-object
/// handles for friction and whitewater-influence lookups.
#[derive(Clone)]
pub struct MeshLevelSet {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub cell_size: f32,

    pub phi: Array3d<f32>,
    pub velocity: Array3d<Vec3>,
    pub object_index: Array3d<i32>,
    velocity_data_enabled: bool,
}

const UNSET_OBJECT: i32 = -1;

impl MeshLevelSet {
    pub fn new(width: usize, height: usize, depth: usize, cell_size: f32) -> Self {
        Self {
            width,
            height,
            depth,
            cell_size,
            phi: Array3d::new(width + 1, height + 1, depth + 1, f32::MAX),
            velocity: Array3d::new(width + 1, height + 1, depth + 1, Vec3::ZERO),
            object_index: Array3d::new(width + 1, height + 1, depth + 1, UNSET_OBJECT),
            velocity_data_enabled: true,
        }
    }

    /// Toggle whether velocity/object samples accompany the distance
    /// data. Disabled when the field will only be negated and unioned.
    pub fn enable_velocity_data(&mut self) {
        self.velocity_data_enabled = true;
    }

    pub fn disable_velocity_data(&mut self) {
        self.velocity_data_enabled = false;
    }

    pub fn is_velocity_data_enabled(&self) -> bool {
        self.velocity_data_enabled
    }

    pub fn reset(&mut self) {
        self.phi.fill(f32::MAX);
        self.velocity.fill(Vec3::ZERO);
        self.object_index.fill(UNSET_OBJECT);
    }

    /// Populate the field from a triangle mesh to an exact band of
    /// `band` cells, tagging covered nodes with `object` and its
    /// velocity.
    pub fn fast_calculate_signed_distance_field(
        &mut self,
        mesh: &TriangleMesh,
        band: usize,
        object: i32,
        object_velocity: Vec3,
    ) {
        mesh_to_sdf(mesh, &mut self.phi, self.cell_size, band);
        if self.velocity_data_enabled {
            self.velocity.fill(object_velocity);
            self.object_index.fill(object);
        }
    }

    /// Invert the sign throughout.
    pub fn negate(&mut self) {
        for v in self.phi.data_mut() {
            *v = -*v;
        }
    }

    /// Pointwise union: keep the smaller distance at each node along
    /// with its velocity and object samples.
    pub fn calculate_union(&mut self, other: &MeshLevelSet) {
        debug_assert_eq!(self.phi.len(), other.phi.len());
        for idx in 0..self.phi.len() {
            if other.phi.data()[idx] < self.phi.data()[idx] {
                self.phi.data_mut()[idx] = other.phi.data()[idx];
                if self.velocity_data_enabled {
                    self.velocity.data_mut()[idx] = if other.velocity_data_enabled {
                        other.velocity.data()[idx]
                    } else {
                        Vec3::ZERO
                    };
                    self.object_index.data_mut()[idx] = if other.velocity_data_enabled {
                        other.object_index.data()[idx]
                    } else {
                        UNSET_OBJECT
                    };
                }
            }
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f32 {
        self.phi.get(i, j, k)
    }

    /// Trilinear distance sample at a world position (node semantics).
    pub fn trilinear_interpolate(&self, pos: Vec3) -> f32 {
        self.phi.interpolate_node(pos, self.cell_size)
    }

    /// Normalized gradient of the distance field; `Vec3::Y` where the
    /// gradient vanishes.
    pub fn trilinear_interpolate_gradient(&self, pos: Vec3) -> Vec3 {
        let eps = 0.25 * self.cell_size;
        let grad = Vec3::new(
            self.trilinear_interpolate(pos + Vec3::X * eps)
                - self.trilinear_interpolate(pos - Vec3::X * eps),
            self.trilinear_interpolate(pos + Vec3::Y * eps)
                - self.trilinear_interpolate(pos - Vec3::Y * eps),
            self.trilinear_interpolate(pos + Vec3::Z * eps)
                - self.trilinear_interpolate(pos - Vec3::Z * eps),
        );
        let len = grad.length();
        if len > 1e-6 {
            grad / len
        } else {
            Vec3::Y
        }
    }

    /// Distance sampled at a cell center (average of the eight
    /// surrounding nodes).
    pub fn distance_at_cell_center(&self, i: usize, j: usize, k: usize) -> f32 {
        let mut sum = 0.0;
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    sum += self.phi.get(i + di, j + dj, k + dk);
                }
            }
        }
        0.125 * sum
    }

    /// Solid velocity at a node.
    #[inline]
    pub fn velocity_at_node(&self, i: usize, j: usize, k: usize) -> Vec3 {
        self.velocity.get(i, j, k)
    }

    /// Solid velocity sampled at a world position (nearest node).
    pub fn velocity_at_position(&self, pos: Vec3) -> Vec3 {
        let i = (pos.x / self.cell_size).round() as i32;
        let j = (pos.y / self.cell_size).round() as i32;
        let k = (pos.z / self.cell_size).round() as i32;
        self.velocity.get_clamped(i, j, k)
    }

    /// Handle of the mesh object nearest to a world position.
    pub fn object_at_position(&self, pos: Vec3) -> Option<usize> {
        let i = (pos.x / self.cell_size).round() as i32;
        let j = (pos.y / self.cell_size).round() as i32;
        let k = (pos.z / self.cell_size).round() as i32;
        let idx = self.object_index.get_clamped(i, j, k);
        (idx != UNSET_OBJECT).then_some(idx as usize)
    }
}

/// Liquid signed distance field computed from marker particle spheres,
/// sampled at cell centers.
#[derive(Clone)]
pub struct ParticleLevelSet {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub cell_size: f32,

    pub phi: Array3d<f32>,
}

impl ParticleLevelSet {
    pub fn new(width: usize, height: usize, depth: usize, cell_size: f32) -> Self {
        let max_distance = 3.0 * cell_size;
        Self {
            width,
            height,
            depth,
            cell_size,
            phi: Array3d::new(width, height, depth, max_distance),
        }
    }

    fn max_distance(&self) -> f32 {
        3.0 * self.cell_size
    }

    /// Rebuild the field as the union of particle spheres of the given
    /// radius.
    pub fn calculate_from_particles(&mut self, positions: &[Vec3], radius: f32) {
        let dx = self.cell_size;
        self.phi.fill(self.max_distance());

        let stencil = (radius / dx).ceil() as i32 + 1;
        for &p in positions {
            let ci = (p.x / dx - 0.5).floor() as i32;
            let cj = (p.y / dx - 0.5).floor() as i32;
            let ck = (p.z / dx - 0.5).floor() as i32;

            for k in (ck - stencil).max(0)..=(ck + stencil).min(self.depth as i32 - 1) {
                for j in (cj - stencil).max(0)..=(cj + stencil).min(self.height as i32 - 1) {
                    for i in (ci - stencil).max(0)..=(ci + stencil).min(self.width as i32 - 1) {
                        let center = Vec3::new(
                            (i as f32 + 0.5) * dx,
                            (j as f32 + 0.5) * dx,
                            (k as f32 + 0.5) * dx,
                        );
                        let dist = (center - p).length() - radius;
                        let idx = self.phi.index(i as usize, j as usize, k as usize);
                        if dist < self.phi.data()[idx] {
                            self.phi.data_mut()[idx] = dist;
                        }
                    }
                }
            }
        }
    }

    /// Treat cells deep inside solids as solid rather than liquid so
    /// stray samples never classify as fluid.
    pub fn clear_cells_inside_solid(&mut self, solid: &MeshLevelSet) {
        let threshold = -0.5 * self.cell_size;
        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    if solid.distance_at_cell_center(i, j, k) < threshold {
                        self.phi.set(i, j, k, self.max_distance());
                    }
                }
            }
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f32 {
        self.phi.get(i, j, k)
    }

    /// Clamped signed read at possibly out-of-range indices; outside the
    /// grid the liquid is absent.
    #[inline]
    pub fn get_signed(&self, i: i32, j: i32, k: i32) -> f32 {
        if self.phi.in_bounds(i, j, k) {
            self.phi.get(i as usize, j as usize, k as usize)
        } else {
            self.max_distance()
        }
    }

    pub fn is_cell_fluid(&self, i: usize, j: usize, k: usize) -> bool {
        self.get(i, j, k) < 0.0
    }

    pub fn trilinear_interpolate(&self, pos: Vec3) -> f32 {
        self.phi.interpolate_cell_centered(pos, self.cell_size)
    }

    /// Cell-centered mean curvature of the surface, clamped to
    /// `[-1/dx, 1/dx]`. Optionally pre-smooth the field with one box
    /// blur pass for a less noisy estimate.
    pub fn calculate_curvature_grid(&self, smooth: bool) -> Array3d<f32> {
        let source = if smooth {
            self.smoothed_phi()
        } else {
            self.phi.clone()
        };

        let dx = self.cell_size;
        let inv_dx = 1.0 / dx;
        let mut curvature = Array3d::new(self.width, self.height, self.depth, 0.0f32);

        let at = |i: i32, j: i32, k: i32| -> f32 { source.get_clamped(i, j, k) };

        for k in 0..self.depth as i32 {
            for j in 0..self.height as i32 {
                for i in 0..self.width as i32 {
                    let px = (at(i + 1, j, k) - at(i - 1, j, k)) * 0.5 * inv_dx;
                    let py = (at(i, j + 1, k) - at(i, j - 1, k)) * 0.5 * inv_dx;
                    let pz = (at(i, j, k + 1) - at(i, j, k - 1)) * 0.5 * inv_dx;

                    let pxx =
                        (at(i + 1, j, k) - 2.0 * at(i, j, k) + at(i - 1, j, k)) * inv_dx * inv_dx;
                    let pyy =
                        (at(i, j + 1, k) - 2.0 * at(i, j, k) + at(i, j - 1, k)) * inv_dx * inv_dx;
                    let pzz =
                        (at(i, j, k + 1) - 2.0 * at(i, j, k) + at(i, j, k - 1)) * inv_dx * inv_dx;

                    let pxy = (at(i + 1, j + 1, k) - at(i + 1, j - 1, k) - at(i - 1, j + 1, k)
                        + at(i - 1, j - 1, k))
                        * 0.25
                        * inv_dx
                        * inv_dx;
                    let pxz = (at(i + 1, j, k + 1) - at(i + 1, j, k - 1) - at(i - 1, j, k + 1)
                        + at(i - 1, j, k - 1))
                        * 0.25
                        * inv_dx
                        * inv_dx;
                    let pyz = (at(i, j + 1, k + 1) - at(i, j + 1, k - 1) - at(i, j - 1, k + 1)
                        + at(i, j - 1, k - 1))
                        * 0.25
                        * inv_dx
                        * inv_dx;

                    let grad_sq = px * px + py * py + pz * pz;
                    let grad = grad_sq.sqrt();
                    let kappa = if grad > 1e-6 {
                        let numer = pxx * (py * py + pz * pz) + pyy * (px * px + pz * pz)
                            + pzz * (px * px + py * py)
                            - 2.0 * (pxy * px * py + pxz * px * pz + pyz * py * pz);
                        (numer / (grad_sq * grad)).clamp(-inv_dx, inv_dx)
                    } else {
                        0.0
                    };
                    curvature.set(i as usize, j as usize, k as usize, kappa);
                }
            }
        }

        curvature
    }

    fn smoothed_phi(&self) -> Array3d<f32> {
        let mut out = self.phi.clone();
        for k in 0..self.depth as i32 {
            for j in 0..self.height as i32 {
                for i in 0..self.width as i32 {
                    let mut sum = 0.0;
                    for dk in -1..=1 {
                        for dj in -1..=1 {
                            for di in -1..=1 {
                                sum += self.phi.get_clamped(i + di, j + dj, k + dk);
                            }
                        }
                    }
                    out.set(i as usize, j as usize, k as usize, sum / 27.0);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Aabb;

    #[test]
    fn test_fraction_inside_segment() {
        assert_eq!(fraction_inside(-1.0, -1.0), 1.0);
        assert_eq!(fraction_inside(1.0, 1.0), 0.0);
        assert!((fraction_inside(-1.0, 1.0) - 0.5).abs() < 1e-6);
        assert!((fraction_inside(-3.0, 1.0) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_fraction_inside_quad_extremes() {
        assert_eq!(fraction_inside_quad(-1.0, -1.0, -1.0, -1.0), 1.0);
        assert_eq!(fraction_inside_quad(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_fraction_inside_quad_half() {
        // Bottom half inside
        let f = fraction_inside_quad(-1.0, -1.0, 1.0, 1.0);
        assert!((f - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tet_fraction_extremes() {
        assert_eq!(tet_fraction_inside([1.0, 2.0, 3.0, 4.0]), 0.0);
        assert_eq!(tet_fraction_inside([-1.0, -2.0, -3.0, -4.0]), 1.0);
    }

    #[test]
    fn test_tet_fraction_one_corner() {
        // One corner at -1, others at +1: small sliver near the corner
        let f = tet_fraction_inside([-1.0, 1.0, 1.0, 1.0]);
        assert!((f - 1.0 / 8.0).abs() < 1e-5, "f = {}", f);
    }

    #[test]
    fn test_cube_volume_fraction_half() {
        // phi = y - 0.5 over the unit cube: bottom half inside
        let phi = |i: usize, j: usize, _k: usize| (j as f32) - 0.5;
        let mut corners = [0.0f32; 8];
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    corners[k * 4 + j * 2 + i] = phi(i, j, k);
                }
            }
        }
        let f = cube_volume_fraction(corners);
        assert!((f - 0.5).abs() < 1e-4, "f = {}", f);
    }

    #[test]
    fn test_mesh_level_set_union_takes_closer_velocity() {
        let mut a = MeshLevelSet::new(4, 4, 4, 1.0);
        let mut b = MeshLevelSet::new(4, 4, 4, 1.0);
        a.phi.fill(2.0);
        a.velocity.fill(Vec3::X);
        b.phi.fill(1.0);
        b.velocity.fill(Vec3::Y);
        b.object_index.fill(3);

        a.calculate_union(&b);

        assert_eq!(a.get(0, 0, 0), 1.0);
        assert_eq!(a.velocity_at_node(0, 0, 0), Vec3::Y);
        assert_eq!(a.object_at_position(Vec3::ZERO), Some(3));
    }

    #[test]
    fn test_negate_inverts_sign() {
        let mut ls = MeshLevelSet::new(2, 2, 2, 1.0);
        ls.phi.fill(1.5);
        ls.negate();
        assert_eq!(ls.get(0, 0, 0), -1.5);
    }

    #[test]
    fn test_solid_sdf_from_cube() {
        let mut ls = MeshLevelSet::new(8, 8, 8, 0.5);
        let cube = TriangleMesh::cube(Aabb::new(Vec3::splat(1.0), Vec3::splat(3.0)));
        ls.fast_calculate_signed_distance_field(&cube, 3, 0, Vec3::ZERO);

        assert!(ls.trilinear_interpolate(Vec3::splat(2.0)) < 0.0);
        assert!(ls.trilinear_interpolate(Vec3::splat(0.2)) > 0.0);
    }

    #[test]
    fn test_particle_level_set_marks_fluid() {
        let mut ls = ParticleLevelSet::new(8, 8, 8, 0.5);
        let positions = vec![Vec3::new(2.25, 2.25, 2.25)];
        ls.calculate_from_particles(&positions, 0.6);

        assert!(ls.is_cell_fluid(4, 4, 4));
        assert!(!ls.is_cell_fluid(0, 0, 0));
    }

    #[test]
    fn test_curvature_flat_surface_is_small() {
        let mut ls = ParticleLevelSet::new(8, 8, 8, 1.0);
        // Planar level set: phi = y - 4
        for k in 0..8 {
            for j in 0..8 {
                for i in 0..8 {
                    ls.phi.set(i, j, k, (j as f32 + 0.5) - 4.0);
                }
            }
        }
        let curvature = ls.calculate_curvature_grid(false);
        assert!(curvature.get(4, 4, 4).abs() < 1e-4);
    }
}

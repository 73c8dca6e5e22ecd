//! Staggered MAC velocity field and the valid-face mask.
//!
//! Velocity components live on cell faces:
//! - `u` (X) on YZ faces at `x = i * dx`, array size `(width+1, height, depth)`
//! - `v` (Y) on XZ faces at `y = j * dx`, array size `(width, height+1, depth)`
//! - `w` (Z) on XY faces at `z = k * dx`, array size `(width, height, depth+1)`

use glam::Vec3;

use crate::array3d::{extrapolate_layers, Array3d};

/// MAC grid velocity field.
#[derive(Clone)]
pub struct MacVelocityField {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub cell_size: f32,

    pub u: Array3d<f32>,
    pub v: Array3d<f32>,
    pub w: Array3d<f32>,
}

impl MacVelocityField {
    pub fn new(width: usize, height: usize, depth: usize, cell_size: f32) -> Self {
        Self {
            width,
            height,
            depth,
            cell_size,
            u: Array3d::new(width + 1, height, depth, 0.0),
            v: Array3d::new(width, height + 1, depth, 0.0),
            w: Array3d::new(width, height, depth + 1, 0.0),
        }
    }

    pub fn clear(&mut self) {
        self.u.fill(0.0);
        self.v.fill(0.0);
        self.w.fill(0.0);
    }

    // ========== Face sample positions ==========

    #[inline]
    pub fn u_position(&self, i: usize, j: usize, k: usize) -> Vec3 {
        Vec3::new(
            i as f32 * self.cell_size,
            (j as f32 + 0.5) * self.cell_size,
            (k as f32 + 0.5) * self.cell_size,
        )
    }

    #[inline]
    pub fn v_position(&self, i: usize, j: usize, k: usize) -> Vec3 {
        Vec3::new(
            (i as f32 + 0.5) * self.cell_size,
            j as f32 * self.cell_size,
            (k as f32 + 0.5) * self.cell_size,
        )
    }

    #[inline]
    pub fn w_position(&self, i: usize, j: usize, k: usize) -> Vec3 {
        Vec3::new(
            (i as f32 + 0.5) * self.cell_size,
            (j as f32 + 0.5) * self.cell_size,
            k as f32 * self.cell_size,
        )
    }

    // ========== Interpolation ==========

    /// Trilinearly interpolated velocity at a world position.
    ///
    /// Each component is interpolated over its own staggered sample
    /// lattice; out-of-range positions use the nearest face samples.
    pub fn velocity_at(&self, pos: Vec3) -> Vec3 {
        let dx = self.cell_size;
        Vec3::new(
            self.u.interpolate_offset(pos, dx, Vec3::new(0.0, 0.5, 0.5)),
            self.v.interpolate_offset(pos, dx, Vec3::new(0.5, 0.0, 0.5)),
            self.w.interpolate_offset(pos, dx, Vec3::new(0.5, 0.5, 0.0)),
        )
    }

    /// Largest face-sample speed, used by the CFL condition.
    pub fn max_component_speed(&self) -> f32 {
        let max_abs = |data: &[f32]| data.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        max_abs(self.u.data())
            .max(max_abs(self.v.data()))
            .max(max_abs(self.w.data()))
    }

    /// Curl of the velocity field evaluated at a cell center.
    ///
    /// Central differences of the interpolated field at half-cell offsets.
    pub fn curl_at_cell_center(&self, i: usize, j: usize, k: usize) -> Vec3 {
        let dx = self.cell_size;
        let p = Vec3::new(
            (i as f32 + 0.5) * dx,
            (j as f32 + 0.5) * dx,
            (k as f32 + 0.5) * dx,
        );
        let h = 0.5 * dx;

        let vxp = self.velocity_at(p + Vec3::X * h);
        let vxm = self.velocity_at(p - Vec3::X * h);
        let vyp = self.velocity_at(p + Vec3::Y * h);
        let vym = self.velocity_at(p - Vec3::Y * h);
        let vzp = self.velocity_at(p + Vec3::Z * h);
        let vzm = self.velocity_at(p - Vec3::Z * h);

        let inv2h = 1.0 / (2.0 * h);
        Vec3::new(
            (vyp.z - vym.z) * inv2h - (vzp.y - vzm.y) * inv2h,
            (vzp.x - vzm.x) * inv2h - (vxp.z - vxm.z) * inv2h,
            (vxp.y - vxm.y) * inv2h - (vyp.x - vym.x) * inv2h,
        )
    }

    /// Fill a cell-centered curl magnitude grid for the whole domain.
    pub fn generate_curl_grid(&self) -> Array3d<f32> {
        let mut curl = Array3d::new(self.width, self.height, self.depth, 0.0f32);
        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    curl.set(i, j, k, self.curl_at_cell_center(i, j, k).length());
                }
            }
        }
        curl
    }

    /// Extrapolate all three components outward from their valid faces.
    ///
    /// Deterministic for a given mask and layer count. The mask is
    /// updated in place to cover the newly filled faces.
    pub fn extrapolate(&mut self, valid: &mut ValidVelocityGrid, layers: usize) {
        extrapolate_layers(&mut self.u, &mut valid.u, layers);
        extrapolate_layers(&mut self.v, &mut valid.v, layers);
        extrapolate_layers(&mut self.w, &mut valid.w, layers);
    }
}

/// Marks which face samples hold fresh data after a transfer or solve.
#[derive(Clone)]
pub struct ValidVelocityGrid {
    pub u: Array3d<bool>,
    pub v: Array3d<bool>,
    pub w: Array3d<bool>,
}

impl ValidVelocityGrid {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            u: Array3d::new(width + 1, height, depth, false),
            v: Array3d::new(width, height + 1, depth, false),
            w: Array3d::new(width, height, depth + 1, false),
        }
    }

    pub fn reset(&mut self) {
        self.u.fill(false);
        self.v.fill(false);
        self.w.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_sizes() {
        let field = MacVelocityField::new(4, 5, 6, 1.0);
        assert_eq!(field.u.len(), 5 * 5 * 6);
        assert_eq!(field.v.len(), 4 * 6 * 6);
        assert_eq!(field.w.len(), 4 * 5 * 7);
    }

    #[test]
    fn test_face_positions() {
        let field = MacVelocityField::new(4, 4, 4, 1.0);
        assert_eq!(field.u_position(0, 0, 0), Vec3::new(0.0, 0.5, 0.5));
        assert_eq!(field.v_position(0, 0, 0), Vec3::new(0.5, 0.0, 0.5));
        assert_eq!(field.w_position(0, 0, 0), Vec3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn test_uniform_field_interpolation() {
        let mut field = MacVelocityField::new(4, 4, 4, 0.5);
        field.u.fill(1.0);
        field.v.fill(2.0);
        field.w.fill(3.0);

        let v = field.velocity_at(Vec3::new(1.0, 1.0, 1.0));
        assert!((v - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-5);
    }

    #[test]
    fn test_uniform_field_has_no_curl() {
        let mut field = MacVelocityField::new(8, 8, 8, 0.5);
        field.u.fill(1.5);
        let curl = field.curl_at_cell_center(4, 4, 4);
        assert!(curl.length() < 1e-4);
    }

    #[test]
    fn test_extrapolation_marks_faces_valid() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        let mut valid = ValidVelocityGrid::new(4, 4, 4);
        field.u.set(2, 2, 2, 5.0);
        valid.u.set(2, 2, 2, true);

        field.extrapolate(&mut valid, 1);

        assert!(valid.u.get(1, 2, 2));
        assert!((field.u.get(1, 2, 2) - 5.0).abs() < 1e-6);
    }
}

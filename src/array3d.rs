//! Dense 3D arrays with flat storage and grid index helpers.

use glam::Vec3;

use crate::error::{Result, SimulationError};

/// Integer cell index into a 3D grid.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
pub struct GridIndex {
    pub i: i32,
    pub j: i32,
    pub k: i32,
}

impl GridIndex {
    pub fn new(i: i32, j: i32, k: i32) -> Self {
        Self { i, j, k }
    }

    /// The six face-adjacent neighbours.
    pub fn neighbours6(&self) -> [GridIndex; 6] {
        [
            GridIndex::new(self.i - 1, self.j, self.k),
            GridIndex::new(self.i + 1, self.j, self.k),
            GridIndex::new(self.i, self.j - 1, self.k),
            GridIndex::new(self.i, self.j + 1, self.k),
            GridIndex::new(self.i, self.j, self.k - 1),
            GridIndex::new(self.i, self.j, self.k + 1),
        ]
    }
}

/// Dense 3D array stored as a flat vector.
///
/// Indexing follows `idx = k * width * height + j * width + i`, matching
/// the layout of every grid in the simulator.
#[derive(Clone, Debug)]
pub struct Array3d<T> {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    data: Vec<T>,
}

impl<T: Copy> Array3d<T> {
    /// Create an array filled with `fill`.
    pub fn new(width: usize, height: usize, depth: usize, fill: T) -> Self {
        Self {
            width,
            height,
            depth,
            data: vec![fill; width * height * depth],
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat index for `(i, j, k)`.
    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        k * self.width * self.height + j * self.width + i
    }

    /// Unflatten a flat index back to `(i, j, k)`.
    #[inline]
    pub fn unflatten(&self, idx: usize) -> (usize, usize, usize) {
        let i = idx % self.width;
        let j = (idx / self.width) % self.height;
        let k = idx / (self.width * self.height);
        (i, j, k)
    }

    /// Check signed indices against the array bounds.
    #[inline]
    pub fn in_bounds(&self, i: i32, j: i32, k: i32) -> bool {
        i >= 0
            && i < self.width as i32
            && j >= 0
            && j < self.height as i32
            && k >= 0
            && k < self.depth as i32
    }

    /// Whether `(i, j, k)` lies on the outermost layer of the array.
    #[inline]
    pub fn on_border(&self, i: i32, j: i32, k: i32) -> bool {
        i == 0
            || j == 0
            || k == 0
            || i == self.width as i32 - 1
            || j == self.height as i32 - 1
            || k == self.depth as i32 - 1
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> T {
        self.data[self.index(i, j, k)]
    }

    /// Get at signed indices, clamping to the nearest in-range sample.
    #[inline]
    pub fn get_clamped(&self, i: i32, j: i32, k: i32) -> T {
        let i = i.clamp(0, self.width as i32 - 1) as usize;
        let j = j.clamp(0, self.height as i32 - 1) as usize;
        let k = k.clamp(0, self.depth as i32 - 1) as usize;
        self.get(i, j, k)
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: T) {
        let idx = self.index(i, j, k);
        self.data[idx] = value;
    }

    /// Bounds-checked set for externally supplied indices.
    pub fn try_set(&mut self, i: i32, j: i32, k: i32, value: T) -> Result<()> {
        if !self.in_bounds(i, j, k) {
            return Err(SimulationError::OutOfRange(format!(
                "grid index ({}, {}, {}) outside {}x{}x{}",
                i, j, k, self.width, self.height, self.depth
            )));
        }
        self.set(i as usize, j as usize, k as usize, value);
        Ok(())
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Raw element slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl Array3d<f32> {
    /// Trilinear interpolation with cell-center sample semantics.
    ///
    /// `pos` is in world units; sample `(i, j, k)` sits at
    /// `((i + 0.5) * dx, (j + 0.5) * dx, (k + 0.5) * dx)`. Positions
    /// outside the sampled region use the nearest in-range samples.
    pub fn interpolate_cell_centered(&self, pos: Vec3, dx: f32) -> f32 {
        self.interpolate_offset(pos, dx, Vec3::splat(0.5))
    }

    /// Trilinear interpolation with node (corner) sample semantics.
    ///
    /// Sample `(i, j, k)` sits at `(i * dx, j * dx, k * dx)`.
    pub fn interpolate_node(&self, pos: Vec3, dx: f32) -> f32 {
        self.interpolate_offset(pos, dx, Vec3::ZERO)
    }

    /// Shared trilinear kernel; `offset` is the sample position of index
    /// `(0, 0, 0)` in cell units.
    pub fn interpolate_offset(&self, pos: Vec3, dx: f32, offset: Vec3) -> f32 {
        let p = pos / dx - offset;
        let i0 = p.x.floor() as i32;
        let j0 = p.y.floor() as i32;
        let k0 = p.z.floor() as i32;
        let t = p - Vec3::new(i0 as f32, j0 as f32, k0 as f32);

        let mut result = 0.0;
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    let val = self.get_clamped(i0 + di, j0 + dj, k0 + dk);
                    let wx = if di == 0 { 1.0 - t.x } else { t.x };
                    let wy = if dj == 0 { 1.0 - t.y } else { t.y };
                    let wz = if dk == 0 { 1.0 - t.z } else { t.z };
                    result += val * wx * wy * wz;
                }
            }
        }
        result
    }

    /// Gradient of the trilinearly interpolated field, central differenced
    /// at half-cell spacing. Cell-center semantics.
    pub fn interpolate_gradient(&self, pos: Vec3, dx: f32) -> Vec3 {
        let eps = 0.5 * dx;
        Vec3::new(
            self.interpolate_cell_centered(pos + Vec3::X * eps, dx)
                - self.interpolate_cell_centered(pos - Vec3::X * eps, dx),
            self.interpolate_cell_centered(pos + Vec3::Y * eps, dx)
                - self.interpolate_cell_centered(pos - Vec3::Y * eps, dx),
            self.interpolate_cell_centered(pos + Vec3::Z * eps, dx)
                - self.interpolate_cell_centered(pos - Vec3::Z * eps, dx),
        ) / (2.0 * eps)
    }

    /// Generate a half-resolution copy by averaging 2x2x2 blocks.
    ///
    /// Odd trailing samples are folded into the last coarse cell.
    pub fn generate_coarse(&self) -> Array3d<f32> {
        let cw = (self.width / 2).max(1);
        let ch = (self.height / 2).max(1);
        let cd = (self.depth / 2).max(1);
        let mut coarse = Array3d::new(cw, ch, cd, 0.0f32);

        for k in 0..cd {
            for j in 0..ch {
                for i in 0..cw {
                    let mut sum = 0.0;
                    for dk in 0..2 {
                        for dj in 0..2 {
                            for di in 0..2 {
                                let fi = (2 * i + di).min(self.width - 1);
                                let fj = (2 * j + dj).min(self.height - 1);
                                let fk = (2 * k + dk).min(self.depth - 1);
                                sum += self.get(fi, fj, fk);
                            }
                        }
                    }
                    coarse.set(i, j, k, 0.125 * sum);
                }
            }
        }
        coarse
    }
}

/// Extrapolate a scalar field outward from its valid samples.
///
/// Each layer assigns an invalid sample the average of its valid
/// 6-neighbours; the result is deterministic for a given mask and layer
/// count because each layer reads only the previous layer's state.
pub fn extrapolate_layers(field: &mut Array3d<f32>, valid: &mut Array3d<bool>, layers: usize) {
    debug_assert_eq!(field.len(), valid.len());
    let (w, h, d) = (field.width, field.height, field.depth);

    for _ in 0..layers {
        let mut new_values: Vec<(usize, f32)> = Vec::new();
        for k in 0..d {
            for j in 0..h {
                for i in 0..w {
                    if valid.get(i, j, k) {
                        continue;
                    }

                    let mut sum = 0.0;
                    let mut count = 0;
                    for n in GridIndex::new(i as i32, j as i32, k as i32).neighbours6() {
                        if valid.in_bounds(n.i, n.j, n.k)
                            && valid.get(n.i as usize, n.j as usize, n.k as usize)
                        {
                            sum += field.get(n.i as usize, n.j as usize, n.k as usize);
                            count += 1;
                        }
                    }

                    if count > 0 {
                        new_values.push((field.index(i, j, k), sum / count as f32));
                    }
                }
            }
        }

        if new_values.is_empty() {
            break;
        }
        for &(idx, v) in &new_values {
            field.data_mut()[idx] = v;
            valid.data_mut()[idx] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_layout() {
        let grid = Array3d::new(4, 5, 6, 0.0f32);
        assert_eq!(grid.index(0, 0, 0), 0);
        assert_eq!(grid.index(1, 0, 0), 1);
        assert_eq!(grid.index(0, 1, 0), 4);
        assert_eq!(grid.index(0, 0, 1), 20);
        assert_eq!(grid.unflatten(grid.index(3, 4, 5)), (3, 4, 5));
    }

    #[test]
    fn test_try_set_out_of_range() {
        let mut grid = Array3d::new(4, 4, 4, 0.0f32);
        assert!(grid.try_set(1, 2, 3, 1.0).is_ok());
        assert!(grid.try_set(4, 0, 0, 1.0).is_err());
        assert!(grid.try_set(0, -1, 0, 1.0).is_err());
    }

    #[test]
    fn test_interpolation_recovers_samples() {
        let mut grid = Array3d::new(4, 4, 4, 0.0f32);
        grid.set(1, 2, 3, 7.0);
        let dx = 0.5;
        let pos = Vec3::new(1.5 * dx, 2.5 * dx, 3.5 * dx);
        assert!((grid.interpolate_cell_centered(pos, dx) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_interpolation_clamps_out_of_range() {
        let mut grid = Array3d::new(2, 2, 2, 3.0f32);
        grid.fill(3.0);
        let v = grid.interpolate_cell_centered(Vec3::new(-10.0, -10.0, -10.0), 1.0);
        assert!((v - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_coarse_generation_averages_blocks() {
        let mut grid = Array3d::new(4, 4, 4, 0.0f32);
        grid.fill(2.0);
        let coarse = grid.generate_coarse();
        assert_eq!(coarse.width, 2);
        for &v in coarse.data() {
            assert!((v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_extrapolation_fills_from_valid_front() {
        let mut field = Array3d::new(5, 1, 1, 0.0f32);
        let mut valid = Array3d::new(5, 1, 1, false);
        field.set(0, 0, 0, 4.0);
        valid.set(0, 0, 0, true);

        extrapolate_layers(&mut field, &mut valid, 2);

        assert!((field.get(1, 0, 0) - 4.0).abs() < 1e-6);
        assert!((field.get(2, 0, 0) - 4.0).abs() < 1e-6);
        assert!(!valid.get(3, 0, 0));
    }
}

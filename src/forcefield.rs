//! Coarse force-field grid queried at face positions.
//!
//! A replaceable backend seam: the simulator only asks for a force
//! vector at a world position, so alternative evaluators can stand in
//! for the dense grid.

use glam::Vec3;

use crate::array3d::Array3d;

/// Anything that can produce a body force at a world position.
pub trait ForceField: Send + Sync {
    fn force_at(&self, pos: Vec3) -> Vec3;
}

/// Per-particle-class multipliers for force-field strength.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct ForceFieldWeights {
    pub fluid: f32,
    pub whitewater_foam: f32,
    pub whitewater_bubble: f32,
    pub whitewater_spray: f32,
    pub whitewater_dust: f32,
}

impl Default for ForceFieldWeights {
    fn default() -> Self {
        Self {
            fluid: 1.0,
            whitewater_foam: 1.0,
            whitewater_bubble: 1.0,
            whitewater_spray: 1.0,
            whitewater_dust: 1.0,
        }
    }
}

/// Dense force samples on a grid coarsened by `reduction_level`.
pub struct ForceFieldGrid {
    pub reduction_level: usize,
    cell_size: f32,
    forces: Array3d<Vec3>,
}

impl ForceFieldGrid {
    /// `width/height/depth` are the fine-grid dimensions; the field is
    /// stored at `1 / reduction_level` resolution.
    pub fn new(
        width: usize,
        height: usize,
        depth: usize,
        cell_size: f32,
        reduction_level: usize,
    ) -> Self {
        let r = reduction_level.max(1);
        Self {
            reduction_level: r,
            cell_size: cell_size * r as f32,
            forces: Array3d::new(
                width.div_ceil(r).max(1),
                height.div_ceil(r).max(1),
                depth.div_ceil(r).max(1),
                Vec3::ZERO,
            ),
        }
    }

    pub fn fill(&mut self, force: Vec3) {
        self.forces.fill(force);
    }

    pub fn set(&mut self, i: usize, j: usize, k: usize, force: Vec3) {
        self.forces.set(i, j, k, force);
    }

    pub fn dimensions(&self) -> (usize, usize, usize) {
        (self.forces.width, self.forces.height, self.forces.depth)
    }
}

impl ForceField for ForceFieldGrid {
    /// Trilinear sample with cell-center semantics on the coarse grid.
    fn force_at(&self, pos: Vec3) -> Vec3 {
        let dx = self.cell_size;
        let p = pos / dx - Vec3::splat(0.5);
        let i0 = p.x.floor() as i32;
        let j0 = p.y.floor() as i32;
        let k0 = p.z.floor() as i32;
        let t = p - Vec3::new(i0 as f32, j0 as f32, k0 as f32);

        let mut result = Vec3::ZERO;
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    let f = self.forces.get_clamped(i0 + di, j0 + dj, k0 + dk);
                    let wx = if di == 0 { 1.0 - t.x } else { t.x };
                    let wy = if dj == 0 { 1.0 - t.y } else { t.y };
                    let wz = if dk == 0 { 1.0 - t.z } else { t.z };
                    result += f * (wx * wy * wz);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduction_shrinks_storage() {
        let field = ForceFieldGrid::new(16, 16, 16, 0.5, 4);
        assert_eq!(field.dimensions(), (4, 4, 4));
    }

    #[test]
    fn test_uniform_field_sampling() {
        let mut field = ForceFieldGrid::new(8, 8, 8, 0.5, 2);
        field.fill(Vec3::new(0.0, -9.81, 0.0));
        let f = field.force_at(Vec3::splat(1.7));
        assert!((f.y + 9.81).abs() < 1e-5);
    }
}

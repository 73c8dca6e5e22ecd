//! Obstacle lifecycle and solid level set composition.
//!
//! Static (non-animated) obstacles contribute to a cached solid SDF that
//! is only rebuilt when one of them reports a state change. Animated
//! obstacles are re-rasterized every frame, optionally batched into a
//! single distance computation (fracture optimization). Inversed
//! obstacles rasterize into a temporary field that is negated before the
//! union. The domain boundary contributes a sign-inverted box so the
//! outside of the domain reads as solid.

use glam::Vec3;

use crate::array3d::Array3d;
use crate::error::{Result, SimulationError};
use crate::levelset::MeshLevelSet;
use crate::mesh::{Aabb, TriangleMesh};

/// Stable handle to a registered obstacle.
pub type ObstacleId = usize;

/// Distance band, in cells, for obstacle SDF rasterization.
pub const SOLID_SDF_BAND: usize = 3;

/// A solid obstacle registered with the simulator.
#[derive(Clone)]
pub struct MeshObject {
    pub name: String,
    pub mesh: TriangleMesh,
    pub translation: Vec3,
    pub velocity: Vec3,

    pub enabled: bool,
    pub animated: bool,
    pub inversed: bool,
    /// Face friction in `[0, 1]` applied during velocity constraining.
    pub friction: f32,
    /// Scales whitewater emission near this obstacle.
    pub whitewater_influence: f32,
    /// Dust emission strength near this obstacle.
    pub dust_emission_strength: f32,
    /// Sheeting strength near this obstacle.
    pub sheeting_strength: f32,
    pub priority: i32,

    state_changed: bool,
}

impl MeshObject {
    pub fn new(name: &str, mesh: TriangleMesh) -> Self {
        Self {
            name: name.to_string(),
            mesh,
            translation: Vec3::ZERO,
            velocity: Vec3::ZERO,
            enabled: true,
            animated: false,
            inversed: false,
            friction: 0.0,
            whitewater_influence: 1.0,
            dust_emission_strength: 1.0,
            sheeting_strength: 1.0,
            priority: 0,
            state_changed: true,
        }
    }

    fn transformed_mesh(&self) -> TriangleMesh {
        let mut mesh = self.mesh.clone();
        mesh.translate(self.translation);
        mesh
    }
}

/// Owns obstacles and composes the frame's solid level set.
pub struct SolidScene {
    width: usize,
    height: usize,
    depth: usize,
    cell_size: f32,

    objects: Vec<MeshObject>,
    pub fracture_optimization: bool,
    /// Domain sides indexed `[x-, x+, y-, y+, z-, z+]`; open sides get
    /// no boundary wall.
    pub boundary_open: [bool; 6],

    static_sdf: MeshLevelSet,
    static_sdf_valid: bool,
}

impl SolidScene {
    pub fn new(width: usize, height: usize, depth: usize, cell_size: f32) -> Self {
        Self {
            width,
            height,
            depth,
            cell_size,
            objects: Vec::new(),
            fracture_optimization: false,
            boundary_open: [false; 6],
            static_sdf: MeshLevelSet::new(width, height, depth, cell_size),
            static_sdf_valid: false,
        }
    }

    /// Open or close the domain walls. Open sides extend the boundary
    /// box outward so no wall is rasterized there.
    pub fn set_boundary_open(&mut self, sides: [bool; 6]) {
        if self.boundary_open != sides {
            self.boundary_open = sides;
            self.static_sdf_valid = false;
        }
    }

    // ========== Obstacle lifecycle ==========

    /// Register an obstacle. Names are the identity; re-adding a name
    /// is a duplicate.
    pub fn add_obstacle(&mut self, object: MeshObject) -> Result<ObstacleId> {
        if self.objects.iter().any(|o| o.name == object.name) {
            return Err(SimulationError::Duplicate(format!(
                "obstacle '{}' is already registered",
                object.name
            )));
        }
        self.invalidate_if_static(&object);
        self.objects.push(object);
        Ok(self.objects.len() - 1)
    }

    pub fn remove_obstacle(&mut self, id: ObstacleId) -> Result<MeshObject> {
        if id >= self.objects.len() {
            return Err(SimulationError::OutOfRange(format!(
                "obstacle handle {} does not exist",
                id
            )));
        }
        let object = self.objects.remove(id);
        if !object.animated {
            self.static_sdf_valid = false;
        }
        Ok(object)
    }

    pub fn obstacle(&self, id: ObstacleId) -> Option<&MeshObject> {
        self.objects.get(id)
    }

    pub fn obstacle_count(&self) -> usize {
        self.objects.len()
    }

    /// Move an obstacle for this frame. Static obstacles invalidate the
    /// cached SDF; animated obstacles are re-rasterized anyway.
    pub fn set_obstacle_transform(
        &mut self,
        id: ObstacleId,
        translation: Vec3,
        velocity: Vec3,
    ) -> Result<()> {
        let is_static = {
            let object = self.objects.get_mut(id).ok_or_else(|| {
                SimulationError::OutOfRange(format!("obstacle handle {} does not exist", id))
            })?;
            object.translation = translation;
            object.velocity = velocity;
            object.state_changed = true;
            !object.animated
        };
        if is_static {
            self.static_sdf_valid = false;
        }
        Ok(())
    }

    pub fn set_obstacle_enabled(&mut self, id: ObstacleId, enabled: bool) -> Result<()> {
        let is_static = {
            let object = self.objects.get_mut(id).ok_or_else(|| {
                SimulationError::OutOfRange(format!("obstacle handle {} does not exist", id))
            })?;
            if object.enabled != enabled {
                object.enabled = enabled;
                object.state_changed = true;
            }
            !object.animated
        };
        if is_static {
            self.static_sdf_valid = false;
        }
        Ok(())
    }

    fn invalidate_if_static(&mut self, object: &MeshObject) {
        if !object.animated {
            self.static_sdf_valid = false;
        }
    }

    // ========== Solid SDF composition ==========

    /// Compose the frame's solid level set into `out`.
    pub fn update_solid_sdf(&mut self, out: &mut MeshLevelSet) {
        if !self.static_sdf_valid {
            self.rebuild_static_sdf();
        }
        for o in &mut self.objects {
            o.state_changed = false;
        }

        *out = self.static_sdf.clone();
        out.enable_velocity_data();

        if self.fracture_optimization {
            self.add_animated_objects_batched(out);
        } else {
            for idx in 0..self.objects.len() {
                let o = &self.objects[idx];
                if !o.enabled || !o.animated || o.inversed {
                    continue;
                }
                let mut temp = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
                temp.fast_calculate_signed_distance_field(
                    &o.transformed_mesh(),
                    SOLID_SDF_BAND,
                    idx as i32,
                    o.velocity,
                );
                out.calculate_union(&temp);
            }
        }

        // Animated inversed obstacles: rasterize, negate, union
        for idx in 0..self.objects.len() {
            let o = &self.objects[idx];
            if !o.enabled || !o.animated || !o.inversed {
                continue;
            }
            let mut temp = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
            temp.disable_velocity_data();
            temp.fast_calculate_signed_distance_field(
                &o.transformed_mesh(),
                SOLID_SDF_BAND,
                idx as i32,
                o.velocity,
            );
            temp.negate();
            out.calculate_union(&temp);
        }
    }

    /// Whether any static obstacle changed since the cache was built.
    pub fn is_static_state_changed(&self) -> bool {
        !self.static_sdf_valid
    }

    fn rebuild_static_sdf(&mut self) {
        let mut sdf = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
        sdf.reset();

        // Domain boundary: a box spanning the interior, sign-inverted so
        // everything outside the domain is solid. Open sides push the
        // box face far outside the grid so no wall appears there.
        let dx = self.cell_size;
        let margin = 0.5 * dx;
        let far = 100.0 * dx;
        let extent = Vec3::new(
            self.width as f32 * dx,
            self.height as f32 * dx,
            self.depth as f32 * dx,
        );
        let mut lo = Vec3::splat(margin);
        let mut hi = extent - Vec3::splat(margin);
        for axis in 0..3 {
            if self.boundary_open[axis * 2] {
                lo[axis] = -far;
            }
            if self.boundary_open[axis * 2 + 1] {
                hi[axis] = extent[axis] + far;
            }
        }
        let domain_box = TriangleMesh::cube(Aabb::new(lo, hi));
        let mut boundary = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
        boundary.disable_velocity_data();
        boundary.fast_calculate_signed_distance_field(&domain_box, SOLID_SDF_BAND, -1, Vec3::ZERO);
        boundary.negate();
        sdf.calculate_union(&boundary);

        for idx in 0..self.objects.len() {
            let o = &self.objects[idx];
            if !o.enabled || o.animated {
                continue;
            }
            let mut temp = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
            if o.inversed {
                temp.disable_velocity_data();
            }
            temp.fast_calculate_signed_distance_field(
                &o.transformed_mesh(),
                SOLID_SDF_BAND,
                idx as i32,
                Vec3::ZERO,
            );
            if o.inversed {
                temp.negate();
            }
            sdf.calculate_union(&temp);
        }

        self.static_sdf = sdf;
        self.static_sdf_valid = true;
    }

    /// Fracture optimization: one distance computation over the joined
    /// animated meshes, with velocities stamped per object afterwards.
    fn add_animated_objects_batched(&self, out: &mut MeshLevelSet) {
        let mut combined = TriangleMesh::new();
        let mut contributors: Vec<usize> = Vec::new();
        for (idx, o) in self.objects.iter().enumerate() {
            if o.enabled && o.animated && !o.inversed {
                combined.join(&o.transformed_mesh());
                contributors.push(idx);
            }
        }
        if combined.is_empty() {
            return;
        }

        let mut temp = MeshLevelSet::new(self.width, self.height, self.depth, self.cell_size);
        temp.fast_calculate_signed_distance_field(&combined, SOLID_SDF_BAND, -1, Vec3::ZERO);

        // Per-object velocity stamp over each contributor's dilated AABB
        let dx = self.cell_size;
        let band = SOLID_SDF_BAND as f32 * dx;
        for &idx in &contributors {
            let o = &self.objects[idx];
            let bbox = o.transformed_mesh().bounding_box().expand(band);
            let i0 = ((bbox.min.x / dx).floor() as i32).max(0);
            let j0 = ((bbox.min.y / dx).floor() as i32).max(0);
            let k0 = ((bbox.min.z / dx).floor() as i32).max(0);
            let i1 = ((bbox.max.x / dx).ceil() as i32).min(self.width as i32);
            let j1 = ((bbox.max.y / dx).ceil() as i32).min(self.height as i32);
            let k1 = ((bbox.max.z / dx).ceil() as i32).min(self.depth as i32);
            for k in k0..=k1 {
                for j in j0..=j1 {
                    for i in i0..=i1 {
                        temp.velocity.set(i as usize, j as usize, k as usize, o.velocity);
                        temp.object_index.set(i as usize, j as usize, k as usize, idx as i32);
                    }
                }
            }
        }

        out.calculate_union(&temp);
    }
}

/// Coarse boolean grid marking cells near solid geometry, used to gate
/// particle collision resolution.
pub struct NearSolidGrid {
    pub factor: usize,
    pub grid: Array3d<bool>,
    cell_size: f32,
}

impl NearSolidGrid {
    pub fn new(width: usize, height: usize, depth: usize, cell_size: f32, factor: usize) -> Self {
        let factor = factor.max(1);
        Self {
            factor,
            grid: Array3d::new(
                width.div_ceil(factor),
                height.div_ceil(factor),
                depth.div_ceil(factor),
                false,
            ),
            cell_size,
        }
    }

    /// Mark coarse cells whose fine cells lie within `threshold` of
    /// solid.
    pub fn update(&mut self, solid: &MeshLevelSet, threshold: f32) {
        self.grid.fill(false);
        for k in 0..solid.depth {
            for j in 0..solid.height {
                for i in 0..solid.width {
                    if solid.distance_at_cell_center(i, j, k) < threshold {
                        self.grid
                            .set(i / self.factor, j / self.factor, k / self.factor, true);
                    }
                }
            }
        }
    }

    pub fn is_near_solid(&self, pos: Vec3) -> bool {
        let fine = self.cell_size;
        let i = (pos.x / fine) as i32 / self.factor as i32;
        let j = (pos.y / fine) as i32 / self.factor as i32;
        let k = (pos.z / fine) as i32 / self.factor as i32;
        self.grid.get_clamped(i, j, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphereish_cube(center: Vec3, half: f32) -> TriangleMesh {
        TriangleMesh::cube(Aabb::new(center - Vec3::splat(half), center + Vec3::splat(half)))
    }

    #[test]
    fn test_duplicate_obstacle_rejected() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let mesh = sphereish_cube(Vec3::splat(2.0), 0.5);
        scene.add_obstacle(MeshObject::new("crate", mesh.clone())).unwrap();
        let err = scene.add_obstacle(MeshObject::new("crate", mesh));
        assert!(matches!(err, Err(SimulationError::Duplicate(_))));
    }

    #[test]
    fn test_domain_boundary_is_solid_outside() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let mut sdf = MeshLevelSet::new(8, 8, 8, 0.5);
        scene.update_solid_sdf(&mut sdf);

        // Outside the domain walls reads solid, interior reads open
        assert!(sdf.trilinear_interpolate(Vec3::new(0.01, 2.0, 2.0)) < 0.5);
        assert!(sdf.trilinear_interpolate(Vec3::splat(2.0)) > 0.0);
    }

    #[test]
    fn test_static_cache_invalidation() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let id = scene
            .add_obstacle(MeshObject::new("box", sphereish_cube(Vec3::splat(2.0), 0.6)))
            .unwrap();

        let mut sdf = MeshLevelSet::new(8, 8, 8, 0.5);
        scene.update_solid_sdf(&mut sdf);
        assert!(!scene.is_static_state_changed());
        assert!(sdf.trilinear_interpolate(Vec3::splat(2.0)) < 0.0);

        // Moving a static obstacle invalidates the cache
        scene
            .set_obstacle_transform(id, Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO)
            .unwrap();
        assert!(scene.is_static_state_changed());

        scene.update_solid_sdf(&mut sdf);
        assert!(sdf.trilinear_interpolate(Vec3::new(3.0, 2.0, 2.0)) < 0.0);
    }

    #[test]
    fn test_animated_obstacle_carries_velocity() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let mut object = MeshObject::new("paddle", sphereish_cube(Vec3::splat(2.0), 0.6));
        object.animated = true;
        let id = scene.add_obstacle(object).unwrap();
        scene
            .set_obstacle_transform(id, Vec3::ZERO, Vec3::new(1.5, 0.0, 0.0))
            .unwrap();

        let mut sdf = MeshLevelSet::new(8, 8, 8, 0.5);
        scene.update_solid_sdf(&mut sdf);

        let v = sdf.velocity_at_position(Vec3::splat(2.0));
        assert!((v.x - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_inversed_obstacle_solidifies_outside() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let mut object = MeshObject::new("tank", sphereish_cube(Vec3::splat(2.0), 1.5));
        object.inversed = true;
        scene.add_obstacle(object).unwrap();

        let mut sdf = MeshLevelSet::new(8, 8, 8, 0.5);
        scene.update_solid_sdf(&mut sdf);

        // Inside the inversed mesh stays open; outside it is solid
        assert!(sdf.trilinear_interpolate(Vec3::splat(2.0)) > 0.0);
        assert!(sdf.trilinear_interpolate(Vec3::new(3.8, 3.8, 3.8)) < 0.0);
    }

    #[test]
    fn test_near_solid_grid_marks_wall_cells() {
        let mut scene = SolidScene::new(8, 8, 8, 0.5);
        let mut sdf = MeshLevelSet::new(8, 8, 8, 0.5);
        scene.update_solid_sdf(&mut sdf);

        let mut near = NearSolidGrid::new(8, 8, 8, 0.5, 2);
        near.update(&sdf, 1.0);

        assert!(near.is_near_solid(Vec3::new(0.3, 2.0, 2.0)));
        assert!(!near.is_near_solid(Vec3::splat(2.0)));
    }
}

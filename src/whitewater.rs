//! Whitewater: secondary foam, bubble, spray, and dust particles.
//!
//! Emission potentials come from wave-crest curvature, kinetic
//! turbulence, and obstacle dust influence; each maps through a
//! configurable range onto a `[0, 1]` emission energy. Advection is
//! per-type: foam rides the surface, bubbles and dust integrate drag
//! and buoyancy, spray flies ballistically.

use glam::Vec3;
use rand::rngs::StdRng;
use rand::Rng;

use crate::array3d::Array3d;
use crate::forcefield::{ForceField, ForceFieldWeights};
use crate::grid::MacVelocityField;
use crate::levelset::{MeshLevelSet, ParticleLevelSet};

/// Secondary particle classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum WhitewaterType {
    Foam,
    Bubble,
    Spray,
    Dust,
}

/// What happens to a whitewater particle crossing a domain side.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum BoundaryBehaviour {
    Kill,
    Ballistic,
    Collide,
}

/// Domain sides indexed `[x-, x+, y-, y+, z-, z+]`.
pub type BoundarySides = [BoundaryBehaviour; 6];

/// A `[min, max]` potential range mapped onto `[0, 1]`.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct PotentialRange {
    pub min: f32,
    pub max: f32,
}

impl PotentialRange {
    pub fn map(&self, value: f32) -> f32 {
        if self.max <= self.min {
            return 0.0;
        }
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// Whitewater configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct WhitewaterParams {
    pub enabled: bool,
    pub max_particle_count: usize,
    /// Particles per second per unit emission energy.
    pub emission_rate: f32,

    pub wavecrest_potential: PotentialRange,
    pub turbulence_potential: PotentialRange,
    pub energy_potential: PotentialRange,
    pub dust_potential: PotentialRange,
    pub wavecrest_emission_rate: f32,
    pub turbulence_emission_rate: f32,
    pub dust_emission_rate: f32,

    pub min_lifetime: f32,
    pub max_lifetime: f32,
    pub lifetime_variance: f32,
    pub foam_lifetime_modifier: f32,
    pub bubble_lifetime_modifier: f32,
    pub spray_lifetime_modifier: f32,
    pub dust_lifetime_modifier: f32,

    /// Foam stays within this many cells of the surface.
    pub foam_layer_depth: f32,
    pub foam_layer_offset: f32,
    pub foam_advection_strength: f32,
    /// Foam counts interpolate toward `[min, max]` when preservation is
    /// on.
    pub preserve_foam: bool,
    pub min_foam_density: usize,
    pub max_foam_density: usize,

    pub bubble_drag_coefficient: f32,
    pub bubble_bouyancy_coefficient: f32,
    pub spray_drag_coefficient: f32,
    pub dust_drag_coefficient: f32,
    pub dust_bouyancy_coefficient: f32,

    /// Speed above which a surfacing bubble becomes spray.
    pub spray_transition_speed: f32,

    pub foam_boundary: BoundarySides,
    pub bubble_boundary: BoundarySides,
    pub spray_boundary: BoundarySides,
    pub dust_boundary: BoundarySides,
}

impl Default for WhitewaterParams {
    fn default() -> Self {
        let collide = [BoundaryBehaviour::Collide; 6];
        Self {
            enabled: false,
            max_particle_count: 2_000_000,
            emission_rate: 12_000.0,
            wavecrest_potential: PotentialRange { min: 0.4, max: 1.0 },
            turbulence_potential: PotentialRange { min: 100.0, max: 200.0 },
            energy_potential: PotentialRange { min: 0.2, max: 4.0 },
            dust_potential: PotentialRange { min: 0.5, max: 1.5 },
            wavecrest_emission_rate: 1.0,
            turbulence_emission_rate: 1.0,
            dust_emission_rate: 0.0,
            min_lifetime: 0.5,
            max_lifetime: 6.0,
            lifetime_variance: 3.0,
            foam_lifetime_modifier: 1.0,
            bubble_lifetime_modifier: 4.0,
            spray_lifetime_modifier: 2.0,
            dust_lifetime_modifier: 1.0,
            foam_layer_depth: 1.0,
            foam_layer_offset: 0.5,
            foam_advection_strength: 1.0,
            preserve_foam: false,
            min_foam_density: 20,
            max_foam_density: 12_000,
            bubble_drag_coefficient: 0.8,
            bubble_bouyancy_coefficient: 4.0,
            spray_drag_coefficient: 0.05,
            dust_drag_coefficient: 0.75,
            dust_bouyancy_coefficient: -1.0,
            spray_transition_speed: 1.5,
            foam_boundary: collide,
            bubble_boundary: collide,
            spray_boundary: collide,
            dust_boundary: collide,
        }
    }
}

/// Emission and advection inputs for one substep.
pub struct WhitewaterGrids<'a> {
    pub liquid_sdf: &'a ParticleLevelSet,
    pub solid_sdf: &'a MeshLevelSet,
    pub curvature: &'a Array3d<f32>,
    pub turbulence: &'a Array3d<f32>,
    /// Per-cell obstacle whitewater influence scale.
    pub obstacle_influence: &'a Array3d<f32>,
    /// Per-cell obstacle dust emission strength.
    pub dust_strength: &'a Array3d<f32>,
    pub velocity: &'a MacVelocityField,
    /// Optional force field, scaled per particle class.
    pub force_field: Option<&'a dyn ForceField>,
    pub force_field_weights: ForceFieldWeights,
}

impl WhitewaterGrids<'_> {
    fn class_force(&self, kind: WhitewaterType, pos: glam::Vec3) -> glam::Vec3 {
        match self.force_field {
            Some(ff) => {
                let weight = match kind {
                    WhitewaterType::Foam => self.force_field_weights.whitewater_foam,
                    WhitewaterType::Bubble => self.force_field_weights.whitewater_bubble,
                    WhitewaterType::Spray => self.force_field_weights.whitewater_spray,
                    WhitewaterType::Dust => self.force_field_weights.whitewater_dust,
                };
                ff.force_at(pos) * weight
            }
            None => glam::Vec3::ZERO,
        }
    }
}

/// The whitewater particle population, stored column-wise.
#[derive(Default)]
pub struct WhitewaterSystem {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub types: Vec<WhitewaterType>,
    pub lifetimes: Vec<f32>,
    pub ids: Vec<u8>,
    next_id: u8,
}

impl WhitewaterSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn count_of(&self, kind: WhitewaterType) -> usize {
        self.types.iter().filter(|&&t| t == kind).count()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.types.clear();
        self.lifetimes.clear();
        self.ids.clear();
    }

    fn push(
        &mut self,
        position: Vec3,
        velocity: Vec3,
        kind: WhitewaterType,
        lifetime: f32,
    ) {
        self.positions.push(position);
        self.velocities.push(velocity);
        self.types.push(kind);
        self.lifetimes.push(lifetime);
        self.ids.push(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
    }

    /// Remove particles whose mask entry is true, preserving order.
    pub fn remove_masked(&mut self, mask: &[bool]) {
        debug_assert_eq!(mask.len(), self.len());
        let mut write = 0;
        for read in 0..self.len() {
            if !mask[read] {
                self.positions[write] = self.positions[read];
                self.velocities[write] = self.velocities[read];
                self.types[write] = self.types[read];
                self.lifetimes[write] = self.lifetimes[read];
                self.ids[write] = self.ids[read];
                write += 1;
            }
        }
        self.positions.truncate(write);
        self.velocities.truncate(write);
        self.types.truncate(write);
        self.lifetimes.truncate(write);
        self.ids.truncate(write);
    }

    // ========== Emission ==========

    /// Seed new particles from the emission potentials.
    pub fn emit(
        &mut self,
        params: &WhitewaterParams,
        grids: &WhitewaterGrids,
        dt: f32,
        rng: &mut StdRng,
    ) {
        if !params.enabled || self.len() >= params.max_particle_count {
            return;
        }

        let dx = grids.liquid_sdf.cell_size;
        let (width, height, depth) =
            (grids.liquid_sdf.width, grids.liquid_sdf.height, grids.liquid_sdf.depth);

        for k in 0..depth {
            for j in 0..height {
                for i in 0..width {
                    let phi = grids.liquid_sdf.get(i, j, k);
                    // Emitters live in a band around the surface and
                    // inside the liquid
                    if phi > 0.5 * dx || phi < -3.0 * dx {
                        continue;
                    }

                    let center = Vec3::new(
                        (i as f32 + 0.5) * dx,
                        (j as f32 + 0.5) * dx,
                        (k as f32 + 0.5) * dx,
                    );
                    let velocity = grids.velocity.velocity_at(center);
                    let speed_sq = velocity.length_squared();
                    let energy = params.energy_potential.map(0.5 * speed_sq);
                    if energy <= 0.0 {
                        continue;
                    }

                    let influence = grids.obstacle_influence.get(i, j, k);

                    // Wave crest: curved surface moving outward
                    let mut wavecrest = 0.0;
                    if phi > -dx {
                        let curvature = grids.curvature.get(i, j, k) * dx;
                        let normal = grids.liquid_sdf.phi.interpolate_gradient(center, dx);
                        if velocity.dot(normal) > 0.0 {
                            wavecrest = params.wavecrest_potential.map(curvature)
                                * params.wavecrest_emission_rate;
                        }
                    }

                    // Turbulence: velocity-gradient magnitude inside the
                    // liquid
                    let turbulence = params
                        .turbulence_potential
                        .map(grids.turbulence.get(i, j, k))
                        * params.turbulence_emission_rate;

                    // Dust: near influencing obstacles
                    let dust = params.dust_potential.map(grids.dust_strength.get(i, j, k))
                        * params.dust_emission_rate;

                    let potential = (wavecrest + turbulence + dust) * influence;
                    if potential <= 0.0 {
                        continue;
                    }

                    let expected = potential * energy * params.emission_rate * dt;
                    let mut count = expected.floor() as usize;
                    if rng.gen::<f32>() < expected.fract() {
                        count += 1;
                    }

                    for _ in 0..count {
                        if self.len() >= params.max_particle_count {
                            return;
                        }
                        let offset = Vec3::new(
                            rng.gen::<f32>() - 0.5,
                            rng.gen::<f32>() - 0.5,
                            rng.gen::<f32>() - 0.5,
                        ) * dx;
                        let position = center + offset;
                        let sample_phi = grids.liquid_sdf.trilinear_interpolate(position);

                        let kind = if dust > wavecrest && dust > turbulence {
                            WhitewaterType::Dust
                        } else if sample_phi > 0.0 {
                            WhitewaterType::Spray
                        } else if sample_phi < -params.foam_layer_depth * dx {
                            WhitewaterType::Bubble
                        } else {
                            WhitewaterType::Foam
                        };

                        let base = params.min_lifetime
                            + rng.gen::<f32>() * (params.max_lifetime - params.min_lifetime);
                        let variance =
                            (rng.gen::<f32>() - 0.5) * 2.0 * params.lifetime_variance;
                        let lifetime = (base + variance).max(0.01) * lifetime_modifier(params, kind);

                        self.push(position, velocity, kind, lifetime);
                    }
                }
            }
        }
    }

    // ========== Advection and lifetime ==========

    /// Advance the population one substep: advect by type, resolve
    /// boundaries, apply type transitions, and age lifetimes.
    pub fn advect(
        &mut self,
        params: &WhitewaterParams,
        grids: &WhitewaterGrids,
        body_force: Vec3,
        dt: f32,
    ) {
        let dx = grids.liquid_sdf.cell_size;
        let domain_max = Vec3::new(
            grids.liquid_sdf.width as f32 * dx,
            grids.liquid_sdf.height as f32 * dx,
            grids.liquid_sdf.depth as f32 * dx,
        );

        let foam_preserved = params.preserve_foam
            && self.count_of(WhitewaterType::Foam) < params.min_foam_density;

        let mut remove = vec![false; self.len()];
        for idx in 0..self.len() {
            let kind = self.types[idx];
            let mut position = self.positions[idx];
            let mut velocity = self.velocities[idx];
            let fluid_velocity = grids.velocity.velocity_at(position);
            let body_force = body_force + grids.class_force(kind, position);

            match kind {
                WhitewaterType::Foam => {
                    velocity = fluid_velocity * params.foam_advection_strength;
                    position += velocity * dt;
                    // Confine to the surface layer
                    let phi = grids.liquid_sdf.trilinear_interpolate(position);
                    let limit = params.foam_layer_offset * dx;
                    if phi > limit {
                        let normal = grids.liquid_sdf.phi.interpolate_gradient(position, dx);
                        position -= normal * (phi - limit);
                    }
                }
                WhitewaterType::Bubble => {
                    let buoyancy = -params.bubble_bouyancy_coefficient * body_force;
                    let drag =
                        params.bubble_drag_coefficient * (fluid_velocity - velocity) / dt.max(1e-6);
                    velocity += (buoyancy + drag.clamp_length_max(body_force.length() * 10.0)) * dt;
                    position += velocity * dt;
                }
                WhitewaterType::Spray => {
                    velocity += body_force * dt;
                    velocity *= 1.0 - params.spray_drag_coefficient * dt;
                    position += velocity * dt;
                }
                WhitewaterType::Dust => {
                    let buoyancy = -params.dust_bouyancy_coefficient * body_force;
                    let drag =
                        params.dust_drag_coefficient * (fluid_velocity - velocity) / dt.max(1e-6);
                    velocity += (buoyancy + drag.clamp_length_max(body_force.length() * 10.0)) * dt;
                    position += velocity * dt;
                }
            }

            // Solid collision: push out and remove the normal component
            let solid_phi = grids.solid_sdf.trilinear_interpolate(position);
            if solid_phi < 0.0 {
                let normal = grids.solid_sdf.trilinear_interpolate_gradient(position);
                position -= normal * solid_phi;
                let vn = velocity.dot(normal);
                if vn < 0.0 {
                    velocity -= normal * vn;
                }
            }

            // Domain sides
            let behaviour = boundary_for(params, kind);
            let mut killed = false;
            for side in 0..6 {
                let (axis, positive) = (side / 2, side % 2 == 1);
                let coord = position[axis];
                let limit = if positive { domain_max[axis] } else { 0.0 };
                let outside = if positive { coord > limit } else { coord < limit };
                if !outside {
                    continue;
                }
                match behaviour[side_index(axis, positive)] {
                    BoundaryBehaviour::Kill => killed = true,
                    BoundaryBehaviour::Ballistic => {
                        // Free flight; reap once it is far past the side
                        if (coord - limit).abs() > 5.0 * dx {
                            killed = true;
                        }
                    }
                    BoundaryBehaviour::Collide => {
                        position[axis] = limit.clamp(0.5 * dx, domain_max[axis] - 0.5 * dx);
                        if (velocity[axis] > 0.0) == positive {
                            velocity[axis] = 0.0;
                        }
                    }
                }
            }

            // Type transitions
            let phi = grids.liquid_sdf.trilinear_interpolate(position);
            let new_kind = match kind {
                WhitewaterType::Foam if phi < -params.foam_layer_depth * dx => {
                    WhitewaterType::Bubble
                }
                WhitewaterType::Bubble if phi > 0.0 => {
                    if velocity.length() > params.spray_transition_speed {
                        WhitewaterType::Spray
                    } else {
                        WhitewaterType::Foam
                    }
                }
                WhitewaterType::Spray if phi < -dx => WhitewaterType::Bubble,
                other => other,
            };

            // Lifetime
            let decays = !(new_kind == WhitewaterType::Foam && foam_preserved);
            if decays {
                self.lifetimes[idx] -= dt;
            }
            if self.lifetimes[idx] <= 0.0 || killed {
                remove[idx] = true;
            }

            self.positions[idx] = position;
            self.velocities[idx] = velocity;
            self.types[idx] = new_kind;
        }

        self.remove_masked(&remove);

        // Foam density ceiling
        if params.preserve_foam {
            let foam_count = self.count_of(WhitewaterType::Foam);
            if foam_count > params.max_foam_density {
                let mut excess = foam_count - params.max_foam_density;
                let mut mask = vec![false; self.len()];
                for (idx, &t) in self.types.iter().enumerate() {
                    if excess == 0 {
                        break;
                    }
                    if t == WhitewaterType::Foam {
                        mask[idx] = true;
                        excess -= 1;
                    }
                }
                self.remove_masked(&mask);
            }
        }
    }
}

fn lifetime_modifier(params: &WhitewaterParams, kind: WhitewaterType) -> f32 {
    match kind {
        WhitewaterType::Foam => params.foam_lifetime_modifier,
        WhitewaterType::Bubble => params.bubble_lifetime_modifier,
        WhitewaterType::Spray => params.spray_lifetime_modifier,
        WhitewaterType::Dust => params.dust_lifetime_modifier,
    }
}

fn boundary_for(params: &WhitewaterParams, kind: WhitewaterType) -> &BoundarySides {
    match kind {
        WhitewaterType::Foam => &params.foam_boundary,
        WhitewaterType::Bubble => &params.bubble_boundary,
        WhitewaterType::Spray => &params.spray_boundary,
        WhitewaterType::Dust => &params.dust_boundary,
    }
}

#[inline]
fn side_index(axis: usize, positive: bool) -> usize {
    axis * 2 + usize::from(positive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn grids_with_pool(
        n: usize,
        dx: f32,
        fill_height: usize,
    ) -> (ParticleLevelSet, MeshLevelSet, Array3d<f32>, Array3d<f32>, Array3d<f32>, Array3d<f32>)
    {
        // Linear depth field: phi = (y - surface), surface at fill_height
        let mut liquid = ParticleLevelSet::new(n, n, n, dx);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let phi = ((j as f32 + 0.5) - fill_height as f32) * dx;
                    liquid.phi.set(i, j, k, phi.min(3.0 * dx));
                }
            }
        }
        let mut solid = MeshLevelSet::new(n, n, n, dx);
        solid.phi.fill(10.0 * dx);
        let curvature = Array3d::new(n, n, n, 1.0f32 / dx);
        let turbulence = Array3d::new(n, n, n, 0.0f32);
        let influence = Array3d::new(n, n, n, 1.0f32);
        let dust = Array3d::new(n, n, n, 0.0f32);
        (liquid, solid, curvature, turbulence, influence, dust)
    }

    fn active_params() -> WhitewaterParams {
        WhitewaterParams {
            enabled: true,
            wavecrest_potential: PotentialRange { min: 0.0, max: 0.5 },
            energy_potential: PotentialRange { min: 0.0, max: 0.5 },
            emission_rate: 50_000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_emission_from_agitated_surface() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 4);
        let mut field = MacVelocityField::new(n, n, n, dx);
        field.v.fill(3.0);

        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        let mut system = WhitewaterSystem::new();
        let mut rng = StdRng::seed_from_u64(7);
        system.emit(&active_params(), &grids, 1.0 / 30.0, &mut rng);

        assert!(!system.is_empty(), "agitated surface should emit");
        for (&t, &l) in system.types.iter().zip(&system.lifetimes) {
            assert!(matches!(
                t,
                WhitewaterType::Foam
                    | WhitewaterType::Bubble
                    | WhitewaterType::Spray
                    | WhitewaterType::Dust
            ));
            assert!(l > 0.0);
        }
    }

    #[test]
    fn test_emission_respects_max_count() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 4);
        let mut field = MacVelocityField::new(n, n, n, dx);
        field.v.fill(5.0);

        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        let mut params = active_params();
        params.max_particle_count = 10;
        let mut system = WhitewaterSystem::new();
        let mut rng = StdRng::seed_from_u64(7);
        system.emit(&params, &grids, 1.0, &mut rng);
        assert!(system.len() <= 10);
    }

    #[test]
    fn test_lifetime_decay_removes_particles() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 4);
        let field = MacVelocityField::new(n, n, n, dx);
        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        let mut system = WhitewaterSystem::new();
        system.push(Vec3::splat(1.0), Vec3::ZERO, WhitewaterType::Foam, 0.01);
        system.advect(&active_params(), &grids, Vec3::new(0.0, -9.81, 0.0), 0.1);
        assert!(system.is_empty());
    }

    #[test]
    fn test_foam_becomes_bubble_when_submerged() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 8);
        let field = MacVelocityField::new(n, n, n, dx);
        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        // Whole domain is liquid, so foam at the center is deep inside
        let mut system = WhitewaterSystem::new();
        system.push(Vec3::splat(2.0), Vec3::ZERO, WhitewaterType::Foam, 5.0);
        system.advect(&active_params(), &grids, Vec3::new(0.0, -9.81, 0.0), 1.0 / 60.0);

        assert_eq!(system.types[0], WhitewaterType::Bubble);
    }

    #[test]
    fn test_bubble_rises_against_gravity() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 8);
        let field = MacVelocityField::new(n, n, n, dx);
        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        let mut system = WhitewaterSystem::new();
        system.push(Vec3::splat(2.0), Vec3::ZERO, WhitewaterType::Bubble, 5.0);
        system.advect(&active_params(), &grids, Vec3::new(0.0, -9.81, 0.0), 1.0 / 60.0);

        assert!(system.velocities[0].y > 0.0, "buoyancy should lift bubbles");
    }

    #[test]
    fn test_kill_boundary_removes_escapees() {
        let (n, dx) = (8, 0.5);
        let (liquid, solid, curvature, turbulence, influence, dust) = grids_with_pool(n, dx, 4);
        let field = MacVelocityField::new(n, n, n, dx);
        let grids = WhitewaterGrids {
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            curvature: &curvature,
            turbulence: &turbulence,
            obstacle_influence: &influence,
            dust_strength: &dust,
            velocity: &field,
            force_field: None,
            force_field_weights: ForceFieldWeights::default(),
        };

        let mut params = active_params();
        params.spray_boundary = [BoundaryBehaviour::Kill; 6];
        let mut system = WhitewaterSystem::new();
        system.push(
            Vec3::new(2.0, 3.9, 2.0),
            Vec3::new(0.0, 50.0, 0.0),
            WhitewaterType::Spray,
            5.0,
        );
        system.advect(&params, &grids, Vec3::new(0.0, -9.81, 0.0), 0.1);
        assert!(system.is_empty());
    }

    #[test]
    fn test_ids_wrap_around() {
        let mut system = WhitewaterSystem::new();
        for _ in 0..300 {
            system.push(Vec3::ZERO, Vec3::ZERO, WhitewaterType::Foam, 1.0);
        }
        assert_eq!(system.ids[0], 0);
        assert_eq!(system.ids[255], 255);
        assert_eq!(system.ids[256], 0);
    }
}

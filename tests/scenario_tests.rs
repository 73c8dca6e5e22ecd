//! Scene-level scenarios: obstacles with inflows, whitewater seeding,
//! open boundaries, and outflow culling.

use glam::Vec3;
use undertow::particles::ATTR_POSITION;
use undertow::whitewater::PotentialRange;
use undertow::{
    Aabb, FluidSimulation, MeshFluidSource, MeshObject, SourceMode, TriangleMesh,
};

#[test]
fn inflow_fills_around_a_static_obstacle() {
    let (n, dx) = (12, 0.1);
    let mut sim = FluidSimulation::new(n, n, n, dx).unwrap();
    sim.add_body_force(Vec3::new(0.0, -9.81, 0.0));
    sim.set_random_seed(9);

    // Obstacle block in the middle of the tank
    let obstacle_mesh = TriangleMesh::cube(Aabb::new(Vec3::splat(0.45), Vec3::splat(0.75)));
    sim.add_obstacle(MeshObject::new("block", obstacle_mesh)).unwrap();

    // Inflow near the -X face pushing along +X
    let inflow_mesh = TriangleMesh::cube(Aabb::new(
        Vec3::new(0.1, 0.4, 0.3),
        Vec3::new(0.3, 0.8, 0.9),
    ));
    let mut inflow = MeshFluidSource::new("jet", inflow_mesh, SourceMode::Inflow);
    inflow.velocity = Vec3::new(1.5, 0.0, 0.0);
    sim.add_fluid_source(inflow).unwrap();

    sim.initialize().unwrap();

    let mut last_count = 0;
    let mut grew = 0;
    for _ in 0..8 {
        sim.update(1.0 / 30.0).unwrap();
        let count = sim.frame_stats().fluid_particles;
        if count > last_count {
            grew += 1;
        }
        last_count = count;
    }
    assert!(last_count > 0, "inflow never emitted");
    assert!(grew >= 4, "particle count should grow while filling, grew {} frames", grew);

    // No particle sits deep inside the obstacle
    let positions = sim.particles().vec3_values(ATTR_POSITION).unwrap();
    let inner = Aabb::new(
        Vec3::splat(0.45 + 0.5 * dx),
        Vec3::splat(0.75 - 0.5 * dx),
    );
    for p in positions {
        assert!(!inner.contains(*p), "particle penetrated the obstacle: {:?}", p);
    }
}

#[test]
fn whitewater_appears_after_impact() {
    let (n, dx) = (12, 0.1);
    let mut sim = FluidSimulation::new(n, n, n, dx).unwrap();
    sim.add_body_force(Vec3::new(0.0, -9.81, 0.0));
    sim.set_random_seed(5);

    sim.whitewater_params.enabled = true;
    sim.whitewater_params.emission_rate = 60_000.0;
    sim.whitewater_params.wavecrest_potential = PotentialRange { min: 0.0, max: 0.5 };
    sim.whitewater_params.turbulence_potential = PotentialRange { min: 0.5, max: 5.0 };
    sim.whitewater_params.energy_potential = PotentialRange { min: 0.0, max: 1.0 };

    sim.initialize().unwrap();

    // A pool plus a block dropped from above
    sim.add_fluid_box(
        Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.2, 0.3, 1.2)),
        Vec3::ZERO,
    )
    .unwrap();
    sim.add_fluid_box(
        Aabb::new(Vec3::new(0.4, 0.7, 0.4), Vec3::new(0.8, 1.0, 0.8)),
        Vec3::new(0.0, -2.0, 0.0),
    )
    .unwrap();

    assert_eq!(sim.whitewater_count(), 0, "no whitewater before impact");

    let mut seen_whitewater = false;
    for _ in 0..6 {
        sim.update(1.0 / 30.0).unwrap();
        if sim.whitewater_count() > 0 {
            seen_whitewater = true;
            break;
        }
    }
    assert!(seen_whitewater, "impact should generate whitewater");
}

#[test]
fn open_boundary_drains_particles() {
    let (n, dx) = (10, 0.1);
    let mut sim = FluidSimulation::new(n, n, n, dx).unwrap();
    sim.add_body_force(Vec3::new(0.0, -9.81, 0.0));
    sim.set_random_seed(1);
    // Open the +X side
    sim.set_open_boundaries([false, true, false, false, false, false]);
    sim.set_open_boundary_width(1).unwrap();
    sim.initialize().unwrap();

    sim.add_fluid_box(
        Aabb::new(Vec3::new(0.5, 0.1, 0.3), Vec3::new(1.0, 0.5, 0.7)),
        Vec3::new(3.0, 0.0, 0.0),
    )
    .unwrap();
    let initial = sim.particle_count();

    for _ in 0..15 {
        sim.update(1.0 / 30.0).unwrap();
    }

    // Much of the liquid was pushed out the open side
    assert!(
        sim.particle_count() < initial,
        "open boundary should drain particles: {} -> {}",
        initial,
        sim.particle_count()
    );

    // Survivors respect the open-boundary margin
    let limit = 1.0 - 1.0 * dx;
    let positions = sim.particles().vec3_values(ATTR_POSITION).unwrap();
    for p in positions {
        assert!(p.x <= limit + 1e-4, "particle past the open margin: {:?}", p);
    }
}

#[test]
fn inversed_outflow_keeps_only_the_region() {
    let (n, dx) = (10, 0.1);
    let mut sim = FluidSimulation::new(n, n, n, dx).unwrap();
    sim.set_random_seed(2);

    let keep_region = Aabb::new(Vec3::new(0.3, 0.0, 0.3), Vec3::new(0.7, 1.0, 0.7));
    let mut outflow = MeshFluidSource::new(
        "keeper",
        TriangleMesh::cube(keep_region),
        SourceMode::Outflow,
    );
    outflow.inversed = true;
    sim.add_fluid_source(outflow).unwrap();
    sim.initialize().unwrap();

    sim.add_fluid_box(
        Aabb::new(Vec3::new(0.1, 0.1, 0.1), Vec3::new(0.9, 0.5, 0.9)),
        Vec3::ZERO,
    )
    .unwrap();

    sim.update(1.0 / 30.0).unwrap();

    assert!(sim.particle_count() > 0);
    let positions = sim.particles().vec3_values(ATTR_POSITION).unwrap();
    for p in positions {
        assert!(
            keep_region.expand(2.0 * dx).contains(*p),
            "particle outside the kept region survived: {:?}",
            p
        );
    }
}

#[test]
fn animated_obstacle_rebuilds_every_frame() {
    let (n, dx) = (10, 0.1);
    let mut sim = FluidSimulation::new(n, n, n, dx).unwrap();
    sim.set_random_seed(4);

    let mut paddle = MeshObject::new(
        "paddle",
        TriangleMesh::cube(Aabb::new(Vec3::new(0.2, 0.2, 0.2), Vec3::new(0.4, 0.8, 0.8))),
    );
    paddle.animated = true;
    let id = sim.add_obstacle(paddle).unwrap();
    sim.initialize().unwrap();

    sim.add_fluid_box(
        Aabb::new(Vec3::new(0.5, 0.1, 0.1), Vec3::new(0.9, 0.5, 0.9)),
        Vec3::ZERO,
    )
    .unwrap();

    // Sweep the paddle toward the liquid
    for frame in 0..5 {
        let t = frame as f32 / 30.0;
        sim.set_obstacle_transform(id, Vec3::new(0.2 * t, 0.0, 0.0), Vec3::new(0.2, 0.0, 0.0))
            .unwrap();
        sim.update(1.0 / 30.0).unwrap();
    }

    // Particles were not swallowed by the moving solid
    let positions = sim.particles().vec3_values(ATTR_POSITION).unwrap();
    let swept = Aabb::new(
        Vec3::new(0.2 + 0.2 * (4.0 / 30.0) + dx, 0.2 + dx, 0.2 + dx),
        Vec3::new(0.4 + 0.2 * (4.0 / 30.0) - dx, 0.8 - dx, 0.8 - dx),
    );
    for p in positions {
        assert!(!swept.contains(*p), "particle inside the moving paddle: {:?}", p);
    }
}

//! 3D hybrid FLIP/APIC liquid simulation.
//!
//! Marker particles carry the liquid; a staggered MAC grid enforces
//! incompressibility against fractional solid obstacles, with optional
//! viscosity and surface tension. Each frame runs CFL-limited substeps
//! and hands a snapshot to an output stage that meshes the surface and
//! packs per-frame byte buffers.
//!
//! # Example
//!
//! ```
//! use glam::Vec3;
//! use undertow::{Aabb, FluidSimulation};
//!
//! let mut sim = FluidSimulation::new(16, 16, 16, 0.1).unwrap();
//! sim.add_body_force(Vec3::new(0.0, -9.81, 0.0));
//! sim.initialize().unwrap();
//!
//! // A block of liquid in the corner
//! sim.add_fluid_box(
//!     Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.8, 1.2, 0.8)),
//!     Vec3::ZERO,
//! )
//! .unwrap();
//!
//! // Run one frame and read the surface mesh buffer
//! sim.update(1.0 / 30.0).unwrap();
//! assert!(!sim.output_buffers().surface_mesh.is_empty());
//! ```

pub mod array3d;
pub mod error;
pub mod forcefield;
pub mod formats;
pub mod grid;
pub mod levelset;
pub mod mesh;
pub mod mesher;
pub mod output;
pub mod particles;
pub mod pcg;
pub mod pressure;
pub mod scene;
pub mod simulation;
pub mod sources;
pub mod transfer;
pub mod viscosity;
pub mod whitewater;

pub use array3d::{Array3d, GridIndex};
pub use error::{Result, SimulationError};
pub use forcefield::{ForceField, ForceFieldGrid, ForceFieldWeights};
pub use formats::MeshOutputFormat;
pub use glam::{Mat3, Vec3};
pub use grid::{MacVelocityField, ValidVelocityGrid};
pub use levelset::{MeshLevelSet, ParticleLevelSet};
pub use mesh::{Aabb, TriangleMesh};
pub use mesher::{ParticleMesher, SurfaceNetsMesher};
pub use output::{
    FluidParticleOutputParams, MeshingParams, OutputBuffers, SurfaceAttributeParams,
    WhitewaterOutputParams,
};
pub use particles::{AttributeKind, ParticleStore};
pub use pcg::SolverStatus;
pub use scene::{MeshObject, ObstacleId, SolidScene};
pub use simulation::{
    ExtremeVelocityRemovalParams, FluidSimulation, FrameStats, FrameTiming, OpenBoundarySides,
};
pub use sources::{
    MeshFluidSource, RigidBodyRotation, SourceId, SourceMode, SourceVelocityField,
};
pub use transfer::VelocityTransferMethod;
pub use whitewater::{BoundaryBehaviour, WhitewaterParams, WhitewaterType};

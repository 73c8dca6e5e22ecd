//! Variational pressure projection with fractional solid weights and
//! optional curvature-driven surface tension.
//!
//! Fluid cells are those with negative liquid SDF. Face coefficients
//! carry the fractional fluid weight in `[0, 1]`; air neighbours enter
//! through the second-order ghost-fluid ratio. The solve is pure: the
//! same grids, weights, SDFs, curvature, `dt` and `rho` always produce
//! the same output.

use glam::Vec3;

use crate::array3d::{Array3d, GridIndex};
use crate::grid::{MacVelocityField, ValidVelocityGrid};
use crate::levelset::{cube_volume_fraction, fraction_inside_quad, MeshLevelSet, ParticleLevelSet};
use crate::pcg::{solve_pcg, SolverStatus, SparseMatrix};

const THETA_LIMIT: f64 = 500.0;
const WEIGHT_EPSILON: f32 = 1e-6;

/// Per-face fractional fluid weights plus the per-cell fluid volume
/// fraction, derived from the solid SDF.
pub struct WeightGrid {
    pub u: Array3d<f32>,
    pub v: Array3d<f32>,
    pub w: Array3d<f32>,
    pub center: Array3d<f32>,
}

impl WeightGrid {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            u: Array3d::new(width + 1, height, depth, 0.0),
            v: Array3d::new(width, height + 1, depth, 0.0),
            w: Array3d::new(width, height, depth + 1, 0.0),
            center: Array3d::new(width, height, depth, 0.0),
        }
    }

    /// Recompute all weights from the solid SDF's nodal samples.
    ///
    /// A face weight is `1 - (area fraction inside solid)`; the center
    /// weight is `1 - (volume fraction inside solid)`.
    pub fn calculate(&mut self, solid: &MeshLevelSet) {
        let (width, height, depth) = (self.center.width, self.center.height, self.center.depth);

        for k in 0..depth {
            for j in 0..height {
                for i in 0..=width {
                    let weight = 1.0
                        - fraction_inside_quad(
                            solid.get(i, j, k),
                            solid.get(i, j + 1, k),
                            solid.get(i, j, k + 1),
                            solid.get(i, j + 1, k + 1),
                        );
                    self.u.set(i, j, k, weight.clamp(0.0, 1.0));
                }
            }
        }

        for k in 0..depth {
            for j in 0..=height {
                for i in 0..width {
                    let weight = 1.0
                        - fraction_inside_quad(
                            solid.get(i, j, k),
                            solid.get(i + 1, j, k),
                            solid.get(i, j, k + 1),
                            solid.get(i + 1, j, k + 1),
                        );
                    self.v.set(i, j, k, weight.clamp(0.0, 1.0));
                }
            }
        }

        for k in 0..=depth {
            for j in 0..height {
                for i in 0..width {
                    let weight = 1.0
                        - fraction_inside_quad(
                            solid.get(i, j, k),
                            solid.get(i + 1, j, k),
                            solid.get(i, j + 1, k),
                            solid.get(i + 1, j + 1, k),
                        );
                    self.w.set(i, j, k, weight.clamp(0.0, 1.0));
                }
            }
        }

        for k in 0..depth {
            for j in 0..height {
                for i in 0..width {
                    let mut corners = [0.0f32; 8];
                    for dk in 0..2 {
                        for dj in 0..2 {
                            for di in 0..2 {
                                corners[dk * 4 + dj * 2 + di] =
                                    solid.get(i + di, j + dj, k + dk);
                            }
                        }
                    }
                    let weight = 1.0 - cube_volume_fraction(corners);
                    self.center.set(i, j, k, weight.clamp(0.0, 1.0));
                }
            }
        }
    }
}

/// Surface-tension inputs for the pressure solve.
pub struct SurfaceTensionParams<'a> {
    /// Surface tension constant sigma.
    pub constant: f32,
    /// Cell-centered mean curvature of the liquid surface.
    pub curvature: &'a Array3d<f32>,
    /// Liquid/air clusters smaller than this cell count get no tension.
    pub cluster_threshold: usize,
}

/// Inputs to [`solve_pressure`].
pub struct PressureSolverParams<'a> {
    pub delta_time: f32,
    pub density: f32,
    pub tolerance: f64,
    pub acceptable_tolerance: f64,
    pub max_iterations: usize,
    pub liquid_sdf: &'a ParticleLevelSet,
    pub solid_sdf: &'a MeshLevelSet,
    pub weights: &'a WeightGrid,
    pub surface_tension: Option<SurfaceTensionParams<'a>>,
}


/// Solid velocities sampled at face positions, locally owned so pocket
/// conditioning can zero entries without touching the scene's SDF.
struct SolidFaceVelocities {
    u: Array3d<f32>,
    v: Array3d<f32>,
    w: Array3d<f32>,
}

impl SolidFaceVelocities {
    fn sample(solid: &MeshLevelSet, field: &MacVelocityField) -> Self {
        let (width, height, depth) = (field.width, field.height, field.depth);
        let mut u = Array3d::new(width + 1, height, depth, 0.0f32);
        let mut v = Array3d::new(width, height + 1, depth, 0.0f32);
        let mut w = Array3d::new(width, height, depth + 1, 0.0f32);

        for k in 0..depth {
            for j in 0..height {
                for i in 0..=width {
                    u.set(i, j, k, solid.velocity_at_position(field.u_position(i, j, k)).x);
                }
            }
        }
        for k in 0..depth {
            for j in 0..=height {
                for i in 0..width {
                    v.set(i, j, k, solid.velocity_at_position(field.v_position(i, j, k)).y);
                }
            }
        }
        for k in 0..=depth {
            for j in 0..height {
                for i in 0..width {
                    w.set(i, j, k, solid.velocity_at_position(field.w_position(i, j, k)).z);
                }
            }
        }

        Self { u, v, w }
    }

    fn zero_cell_faces(&mut self, i: usize, j: usize, k: usize) {
        self.u.set(i, j, k, 0.0);
        self.u.set(i + 1, j, k, 0.0);
        self.v.set(i, j, k, 0.0);
        self.v.set(i, j + 1, k, 0.0);
        self.w.set(i, j, k, 0.0);
        self.w.set(i, j, k + 1, 0.0);
    }
}

/// Cluster suppression status for surface tension, per cell.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ClusterStatus {
    Ok,
    Bad,
}

struct PressureSolveContext<'a> {
    params: &'a PressureSolverParams<'a>,
    width: usize,
    height: usize,
    depth: usize,
    dx: f32,
    pressure_cells: Vec<GridIndex>,
    keymap: Array3d<i32>,
    solid_velocities: SolidFaceVelocities,
    cluster_status: Option<Array3d<ClusterStatus>>,
}

/// Run the pressure projection and update the velocity field in place.
///
/// `pressure` is both the warm start and the output pressure grid; the
/// valid-face mask is reset and re-marked by the velocity update.
pub fn solve_pressure(
    params: &PressureSolverParams,
    field: &mut MacVelocityField,
    valid: &mut ValidVelocityGrid,
    pressure: &mut Array3d<f32>,
) -> SolverStatus {
    let (width, height, depth) = (field.width, field.height, field.depth);
    let dx = field.cell_size;

    // Interior fluid cells are the pressure unknowns
    let mut pressure_cells = Vec::new();
    let mut keymap = Array3d::new(width, height, depth, -1i32);
    for k in 1..depth.saturating_sub(1) {
        for j in 1..height.saturating_sub(1) {
            for i in 1..width.saturating_sub(1) {
                if params.liquid_sdf.is_cell_fluid(i, j, k) {
                    keymap.set(i, j, k, pressure_cells.len() as i32);
                    pressure_cells.push(GridIndex::new(i as i32, j as i32, k as i32));
                }
            }
        }
    }

    let mut solid_velocities = SolidFaceVelocities::sample(params.solid_sdf, field);
    condition_solid_velocities(params, &mut solid_velocities, width, height, depth);

    let cluster_status = params
        .surface_tension
        .as_ref()
        .map(|st| classify_tension_clusters(params.liquid_sdf, st.cluster_threshold));

    let ctx = PressureSolveContext {
        params,
        width,
        height,
        depth,
        dx,
        pressure_cells,
        keymap,
        solid_velocities,
        cluster_status,
    };

    let mat_size = ctx.pressure_cells.len();
    let mut rhs = vec![0.0f64; mat_size];
    calculate_negative_divergence(&ctx, field, &mut rhs);

    let max_rhs = rhs.iter().fold(0.0f64, |m, &x| m.max(x.abs()));
    if max_rhs < params.tolerance {
        pressure.fill(0.0);
        apply_pressure_to_velocity_field(&ctx, field, valid, pressure);
        return SolverStatus {
            success: true,
            partial_success: false,
            iterations: 0,
            error: 0.0,
        };
    }

    let mut matrix = SparseMatrix::new(mat_size, 7);
    calculate_matrix_coefficients(&ctx, &mut matrix);

    let mut solution: Vec<f64> = ctx
        .pressure_cells
        .iter()
        .map(|g| pressure.get(g.i as usize, g.j as usize, g.k as usize) as f64)
        .collect();

    let result = solve_pcg(
        &matrix,
        &rhs,
        &mut solution,
        params.tolerance,
        params.max_iterations,
    );

    pressure.fill(0.0);
    for (g, &p) in ctx.pressure_cells.iter().zip(&solution) {
        pressure.set(g.i as usize, g.j as usize, g.k as usize, p as f32);
    }

    let status = SolverStatus {
        success: result.converged,
        partial_success: !result.converged
            && result.iterations == params.max_iterations
            && result.error < params.acceptable_tolerance,
        iterations: result.iterations,
        error: result.error,
    };

    apply_pressure_to_velocity_field(&ctx, field, valid, pressure);
    status
}

/// Detect fluid pockets fully enclosed by solids and zero the solid
/// velocities on their faces so the linear system stays consistent.
fn condition_solid_velocities(
    params: &PressureSolverParams,
    solid_velocities: &mut SolidFaceVelocities,
    width: usize,
    height: usize,
    depth: usize,
) {
    let liquid = params.liquid_sdf;
    let weights = params.weights;

    // Cells with an open face toward air
    let mut borders_air = Array3d::new(width, height, depth, false);
    for k in 1..depth.saturating_sub(1) {
        for j in 1..height.saturating_sub(1) {
            for i in 1..width.saturating_sub(1) {
                let open = (weights.u.get(i, j, k) >= WEIGHT_EPSILON
                    && liquid.get_signed(i as i32 - 1, j as i32, k as i32) >= 0.0)
                    || (weights.u.get(i + 1, j, k) >= WEIGHT_EPSILON
                        && liquid.get_signed(i as i32 + 1, j as i32, k as i32) >= 0.0)
                    || (weights.v.get(i, j, k) >= WEIGHT_EPSILON
                        && liquid.get_signed(i as i32, j as i32 - 1, k as i32) >= 0.0)
                    || (weights.v.get(i, j + 1, k) >= WEIGHT_EPSILON
                        && liquid.get_signed(i as i32, j as i32 + 1, k as i32) >= 0.0)
                    || (weights.w.get(i, j, k) >= WEIGHT_EPSILON
                        && liquid.get_signed(i as i32, j as i32, k as i32 - 1) >= 0.0)
                    || (weights.w.get(i, j, k + 1) >= WEIGHT_EPSILON
                        && liquid.get_signed(i as i32, j as i32, k as i32 + 1) >= 0.0);
                borders_air.set(i, j, k, open);
            }
        }
    }

    // Flood fluid groups through faces with nonzero fluid weight
    let mut processed = Array3d::new(width, height, depth, false);
    let mut queue: Vec<GridIndex> = Vec::new();
    let mut group: Vec<GridIndex> = Vec::new();

    for k in 1..depth.saturating_sub(1) {
        for j in 1..height.saturating_sub(1) {
            for i in 1..width.saturating_sub(1) {
                if !liquid.is_cell_fluid(i, j, k) {
                    processed.set(i, j, k, true);
                    continue;
                }
                if processed.get(i, j, k) {
                    continue;
                }

                queue.clear();
                group.clear();
                queue.push(GridIndex::new(i as i32, j as i32, k as i32));
                processed.set(i, j, k, true);

                while let Some(g) = queue.pop() {
                    let (gi, gj, gk) = (g.i as usize, g.j as usize, g.k as usize);
                    let candidates = [
                        (GridIndex::new(g.i - 1, g.j, g.k), weights.u.get(gi, gj, gk)),
                        (GridIndex::new(g.i + 1, g.j, g.k), weights.u.get(gi + 1, gj, gk)),
                        (GridIndex::new(g.i, g.j - 1, g.k), weights.v.get(gi, gj, gk)),
                        (GridIndex::new(g.i, g.j + 1, g.k), weights.v.get(gi, gj + 1, gk)),
                        (GridIndex::new(g.i, g.j, g.k - 1), weights.w.get(gi, gj, gk)),
                        (GridIndex::new(g.i, g.j, g.k + 1), weights.w.get(gi, gj, gk + 1)),
                    ];
                    for (n, face_weight) in candidates {
                        if face_weight < WEIGHT_EPSILON
                            || !processed.in_bounds(n.i, n.j, n.k)
                            || processed.get(n.i as usize, n.j as usize, n.k as usize)
                            || liquid.get_signed(n.i, n.j, n.k) >= 0.0
                        {
                            continue;
                        }
                        processed.set(n.i as usize, n.j as usize, n.k as usize, true);
                        if !processed.on_border(n.i, n.j, n.k) {
                            queue.push(n);
                        }
                    }
                    group.push(g);
                }

                if group.len() == 1 {
                    continue;
                }

                let is_isolated = !group
                    .iter()
                    .any(|g| borders_air.get(g.i as usize, g.j as usize, g.k as usize));
                if is_isolated {
                    for g in &group {
                        solid_velocities.zero_cell_faces(
                            g.i as usize,
                            g.j as usize,
                            g.k as usize,
                        );
                    }
                }
            }
        }
    }
}

/// Label same-sign SDF clusters smaller than the threshold as `Bad`;
/// tension terms across those cells are suppressed.
fn classify_tension_clusters(
    liquid: &ParticleLevelSet,
    threshold: usize,
) -> Array3d<ClusterStatus> {
    let (width, height, depth) = (liquid.width, liquid.height, liquid.depth);
    let mut status = Array3d::new(width, height, depth, ClusterStatus::Ok);
    let mut visited = Array3d::new(width, height, depth, false);
    let mut cluster: Vec<GridIndex> = Vec::new();
    let mut queue: Vec<GridIndex> = Vec::new();

    for k in 0..depth {
        for j in 0..height {
            for i in 0..width {
                if visited.get(i, j, k) {
                    continue;
                }
                let inside = liquid.is_cell_fluid(i, j, k);

                cluster.clear();
                queue.clear();
                queue.push(GridIndex::new(i as i32, j as i32, k as i32));
                visited.set(i, j, k, true);

                while let Some(g) = queue.pop() {
                    cluster.push(g);
                    // A cluster past the threshold is fine; keep flooding
                    // to mark it visited but the size no longer matters.
                    for n in g.neighbours6() {
                        if !visited.in_bounds(n.i, n.j, n.k)
                            || visited.get(n.i as usize, n.j as usize, n.k as usize)
                        {
                            continue;
                        }
                        let n_inside =
                            liquid.is_cell_fluid(n.i as usize, n.j as usize, n.k as usize);
                        if n_inside == inside {
                            visited.set(n.i as usize, n.j as usize, n.k as usize, true);
                            queue.push(n);
                        }
                    }
                }

                if cluster.len() < threshold {
                    for g in &cluster {
                        status.set(g.i as usize, g.j as usize, g.k as usize, ClusterStatus::Bad);
                    }
                }
            }
        }
    }

    status
}

/// Ghost-fluid surface-tension pressure across the face between two
/// cells, zero when disabled, same-signed, or cluster-suppressed.
fn surface_tension_term(ctx: &PressureSolveContext, g1: GridIndex, g2: GridIndex) -> f64 {
    let Some(st) = ctx.params.surface_tension.as_ref() else {
        return 0.0;
    };
    if let Some(status) = &ctx.cluster_status {
        if status.get_clamped(g1.i, g1.j, g1.k) == ClusterStatus::Bad
            || status.get_clamped(g2.i, g2.j, g2.k) == ClusterStatus::Bad
        {
            return 0.0;
        }
    }

    let phi1 = ctx.params.liquid_sdf.get_signed(g1.i, g1.j, g1.k);
    let phi2 = ctx.params.liquid_sdf.get_signed(g2.i, g2.j, g2.k);
    if (phi1 < 0.0) == (phi2 < 0.0) {
        return 0.0;
    }

    let dx = ctx.dx;
    let p1 = Vec3::new(
        (g1.i as f32 + 0.5) * dx,
        (g1.j as f32 + 0.5) * dx,
        (g1.k as f32 + 0.5) * dx,
    );
    let p2 = Vec3::new(
        (g2.i as f32 + 0.5) * dx,
        (g2.j as f32 + 0.5) * dx,
        (g2.k as f32 + 0.5) * dx,
    );

    let eps = 1e-6;
    let p = if (phi2 - phi1).abs() < eps {
        p1 + 0.5 * (p2 - p1)
    } else {
        let theta = phi1 / (phi1 - phi2);
        p1 + theta * (p2 - p1)
    };

    let curvature = st.curvature.interpolate_cell_centered(p, dx) as f64;
    st.constant as f64 * curvature
}

fn calculate_negative_divergence(
    ctx: &PressureSolveContext,
    field: &MacVelocityField,
    rhs: &mut [f64],
) {
    let params = ctx.params;
    let weights = params.weights;
    let liquid = params.liquid_sdf;
    let sv = &ctx.solid_velocities;
    let factor = 1.0f64 / ctx.dx as f64;
    let st_factor = params.delta_time as f64 / (ctx.dx as f64 * ctx.dx as f64);
    let eps = 1e-9f64;

    for (idx, g) in ctx.pressure_cells.iter().enumerate() {
        let (i, j, k) = (g.i as usize, g.j as usize, g.k as usize);

        let vol_center = weights.center.get(i, j, k) as f64;
        let vol_right = weights.u.get(i + 1, j, k) as f64;
        let vol_left = weights.u.get(i, j, k) as f64;
        let vol_top = weights.v.get(i, j + 1, k) as f64;
        let vol_bottom = weights.v.get(i, j, k) as f64;
        let vol_front = weights.w.get(i, j, k + 1) as f64;
        let vol_back = weights.w.get(i, j, k) as f64;

        let mut divergence = 0.0f64;
        divergence += -factor * vol_right * field.u.get(i + 1, j, k) as f64;
        divergence += factor * vol_left * field.u.get(i, j, k) as f64;
        divergence += -factor * vol_top * field.v.get(i, j + 1, k) as f64;
        divergence += factor * vol_bottom * field.v.get(i, j, k) as f64;
        divergence += -factor * vol_front * field.w.get(i, j, k + 1) as f64;
        divergence += factor * vol_back * field.w.get(i, j, k) as f64;

        divergence += factor * (vol_right - vol_center) * sv.u.get(i + 1, j, k) as f64;
        divergence += -factor * (vol_left - vol_center) * sv.u.get(i, j, k) as f64;
        divergence += factor * (vol_top - vol_center) * sv.v.get(i, j + 1, k) as f64;
        divergence += -factor * (vol_bottom - vol_center) * sv.v.get(i, j, k) as f64;
        divergence += factor * (vol_front - vol_center) * sv.w.get(i, j, k + 1) as f64;
        divergence += -factor * (vol_back - vol_center) * sv.w.get(i, j, k) as f64;

        if params.surface_tension.is_some() {
            let phi_center = liquid.get(i, j, k) as f64;
            let neighbours = [
                (GridIndex::new(g.i + 1, g.j, g.k), vol_right),
                (GridIndex::new(g.i - 1, g.j, g.k), vol_left),
                (GridIndex::new(g.i, g.j + 1, g.k), vol_top),
                (GridIndex::new(g.i, g.j - 1, g.k), vol_bottom),
                (GridIndex::new(g.i, g.j, g.k + 1), vol_front),
                (GridIndex::new(g.i, g.j, g.k - 1), vol_back),
            ];
            for (n, vol) in neighbours {
                let phi_n = liquid.get_signed(n.i, n.j, n.k) as f64;
                if phi_n >= 0.0 {
                    let tension = surface_tension_term(ctx, *g, n);
                    let theta =
                        ((phi_center - phi_n) / (phi_center + eps)).clamp(-THETA_LIMIT, THETA_LIMIT);
                    divergence += st_factor * vol * theta * tension;
                }
            }
        }

        rhs[idx] = divergence;
    }
}

fn calculate_matrix_coefficients(ctx: &PressureSolveContext, matrix: &mut SparseMatrix) {
    let params = ctx.params;
    let weights = params.weights;
    let liquid = params.liquid_sdf;
    let factor =
        params.delta_time as f64 / (ctx.dx as f64 * ctx.dx as f64 * params.density as f64);
    let eps = 1e-9f64;

    for (index, g) in ctx.pressure_cells.iter().enumerate() {
        let (i, j, k) = (g.i as usize, g.j as usize, g.k as usize);
        let phi_center = liquid.get(i, j, k) as f64;

        let faces = [
            (GridIndex::new(g.i + 1, g.j, g.k), weights.u.get(i + 1, j, k) as f64),
            (GridIndex::new(g.i - 1, g.j, g.k), weights.u.get(i, j, k) as f64),
            (GridIndex::new(g.i, g.j + 1, g.k), weights.v.get(i, j + 1, k) as f64),
            (GridIndex::new(g.i, g.j - 1, g.k), weights.v.get(i, j, k) as f64),
            (GridIndex::new(g.i, g.j, g.k + 1), weights.w.get(i, j, k + 1) as f64),
            (GridIndex::new(g.i, g.j, g.k - 1), weights.w.get(i, j, k) as f64),
        ];

        let mut diag: f64 = faces.iter().map(|(_, vol)| vol).sum::<f64>() * factor;

        for (n, vol) in faces {
            let phi_n = liquid.get_signed(n.i, n.j, n.k) as f64;
            if phi_n < 0.0 {
                let col = ctx.keymap.get_clamped(n.i, n.j, n.k);
                if col >= 0 {
                    matrix.add(index, col as usize, -vol * factor);
                } else {
                    // Fluid neighbour outside the unknown set (border
                    // cell): treat the face as closed.
                    diag -= vol * factor;
                }
            } else {
                let theta = (phi_n / (phi_center + eps)).clamp(-THETA_LIMIT, THETA_LIMIT);
                diag -= vol * factor * theta;
            }
        }

        matrix.set(index, index, diag.max(0.0));
    }
}

fn apply_pressure_to_velocity_field(
    ctx: &PressureSolveContext,
    field: &mut MacVelocityField,
    valid: &mut ValidVelocityGrid,
    pressure: &Array3d<f32>,
) {
    let params = ctx.params;
    let liquid = params.liquid_sdf;
    let weights = params.weights;
    let factor = params.delta_time / (ctx.dx * params.density);
    let (width, height, depth) = (ctx.width, ctx.height, ctx.depth);

    valid.reset();

    let is_fluid = |i: i32, j: i32, k: i32| liquid.get_signed(i, j, k) < 0.0;

    // U faces
    for k in 0..depth {
        for j in 0..height {
            for i in 1..width {
                let left = GridIndex::new(i as i32 - 1, j as i32, k as i32);
                let right = GridIndex::new(i as i32, j as i32, k as i32);
                let borders_fluid = is_fluid(left.i, left.j, left.k)
                    || is_fluid(right.i, right.j, right.k);

                if weights.u.get(i, j, k) > 0.0 && borders_fluid {
                    let (p1, p2) = face_pressures(ctx, pressure, left, right);
                    let u = field.u.get(i, j, k);
                    field.u.set(i, j, k, u - factor * (p2 - p1));
                    valid.u.set(i, j, k, true);
                } else {
                    field.u.set(i, j, k, 0.0);
                }
            }
        }
    }

    // V faces
    for k in 0..depth {
        for j in 1..height {
            for i in 0..width {
                let bottom = GridIndex::new(i as i32, j as i32 - 1, k as i32);
                let top = GridIndex::new(i as i32, j as i32, k as i32);
                let borders_fluid = is_fluid(bottom.i, bottom.j, bottom.k)
                    || is_fluid(top.i, top.j, top.k);

                if weights.v.get(i, j, k) > 0.0 && borders_fluid {
                    let (p1, p2) = face_pressures(ctx, pressure, bottom, top);
                    let v = field.v.get(i, j, k);
                    field.v.set(i, j, k, v - factor * (p2 - p1));
                    valid.v.set(i, j, k, true);
                } else {
                    field.v.set(i, j, k, 0.0);
                }
            }
        }
    }

    // W faces
    for k in 1..depth {
        for j in 0..height {
            for i in 0..width {
                let back = GridIndex::new(i as i32, j as i32, k as i32 - 1);
                let front = GridIndex::new(i as i32, j as i32, k as i32);
                let borders_fluid = is_fluid(back.i, back.j, back.k)
                    || is_fluid(front.i, front.j, front.k);

                if weights.w.get(i, j, k) > 0.0 && borders_fluid {
                    let (p1, p2) = face_pressures(ctx, pressure, back, front);
                    let w = field.w.get(i, j, k);
                    field.w.set(i, j, k, w - factor * (p2 - p1));
                    valid.w.set(i, j, k, true);
                } else {
                    field.w.set(i, j, k, 0.0);
                }
            }
        }
    }
}

/// Ghost pressure on the air side of a surface-crossing face, in the
/// second-order ghost-fluid form with the tension term folded in.
fn ghost_pressure(
    ctx: &PressureSolveContext,
    fluid_cell: GridIndex,
    air_cell: GridIndex,
    p_fluid: f32,
) -> f32 {
    let liquid = ctx.params.liquid_sdf;
    let eps = 1e-6f32;
    let limit = THETA_LIMIT as f32;

    let phi_fluid = liquid.get_signed(fluid_cell.i, fluid_cell.j, fluid_cell.k);
    let phi_air = liquid.get_signed(air_cell.i, air_cell.j, air_cell.k);
    let tension = surface_tension_term(ctx, fluid_cell, air_cell) as f32;
    let theta_pressure = (phi_air / (phi_fluid + eps)).clamp(-limit, limit);
    let theta_tension = ((phi_fluid - phi_air) / (phi_fluid + eps)).clamp(-limit, limit);
    theta_tension * tension + theta_pressure * p_fluid
}

/// Pressures on the two sides of a face, substituting the ghost-fluid
/// value when one side is air.
fn face_pressures(
    ctx: &PressureSolveContext,
    pressure: &Array3d<f32>,
    a: GridIndex,
    b: GridIndex,
) -> (f32, f32) {
    let liquid = ctx.params.liquid_sdf;
    let a_fluid = liquid.get_signed(a.i, a.j, a.k) < 0.0;
    let b_fluid = liquid.get_signed(b.i, b.j, b.k) < 0.0;

    let pa = pressure.get_clamped(a.i, a.j, a.k);
    let pb = pressure.get_clamped(b.i, b.j, b.k);

    if a_fluid && b_fluid {
        (pa, pb)
    } else if a_fluid {
        (pa, ghost_pressure(ctx, a, b, pa))
    } else if b_fluid {
        (ghost_pressure(ctx, b, a, pb), pb)
    } else {
        (0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_solid(width: usize, height: usize, depth: usize, dx: f32) -> MeshLevelSet {
        let mut solid = MeshLevelSet::new(width, height, depth, dx);
        solid.phi.fill(10.0 * dx);
        solid
    }

    fn fluid_block(
        width: usize,
        height: usize,
        depth: usize,
        dx: f32,
        lo: (usize, usize, usize),
        hi: (usize, usize, usize),
    ) -> ParticleLevelSet {
        let mut liquid = ParticleLevelSet::new(width, height, depth, dx);
        for k in lo.2..hi.2 {
            for j in lo.1..hi.1 {
                for i in lo.0..hi.0 {
                    liquid.phi.set(i, j, k, -0.5 * dx);
                }
            }
        }
        liquid
    }

    #[test]
    fn test_weight_grid_open_domain_is_unity() {
        let solid = open_solid(4, 4, 4, 1.0);
        let mut weights = WeightGrid::new(4, 4, 4);
        weights.calculate(&solid);
        assert!((weights.u.get(2, 1, 1) - 1.0).abs() < 1e-6);
        assert!((weights.center.get(1, 1, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weight_grid_solid_domain_is_zero() {
        let mut solid = open_solid(4, 4, 4, 1.0);
        solid.phi.fill(-1.0);
        let mut weights = WeightGrid::new(4, 4, 4);
        weights.calculate(&solid);
        assert!(weights.u.get(2, 1, 1).abs() < 1e-6);
        assert!(weights.center.get(1, 1, 1).abs() < 1e-6);
    }

    #[test]
    fn test_divergent_field_becomes_divergence_free() {
        let (n, dx) = (8, 0.5);
        let mut field = MacVelocityField::new(n, n, n, dx);
        let mut valid = ValidVelocityGrid::new(n, n, n);
        let mut pressure = Array3d::new(n, n, n, 0.0f32);

        let solid = open_solid(n, n, n, dx);
        let mut weights = WeightGrid::new(n, n, n);
        weights.calculate(&solid);
        let liquid = fluid_block(n, n, n, dx, (2, 2, 2), (6, 6, 6));

        // Divergent velocity inside the block
        field.u.set(4, 4, 4, 1.0);

        let params = PressureSolverParams {
            delta_time: 1.0 / 30.0,
            density: 1000.0,
            tolerance: 1e-9,
            acceptable_tolerance: 1e-4,
            max_iterations: 500,
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            weights: &weights,
            surface_tension: None,
        };

        let status = solve_pressure(&params, &mut field, &mut valid, &mut pressure);
        assert!(status.success, "status: {:?}", status);

        // Interior fluid cells should be (near) divergence free
        let mut max_div = 0.0f32;
        for k in 3..5 {
            for j in 3..5 {
                for i in 3..5 {
                    let div = (field.u.get(i + 1, j, k) - field.u.get(i, j, k))
                        + (field.v.get(i, j + 1, k) - field.v.get(i, j, k))
                        + (field.w.get(i, j, k + 1) - field.w.get(i, j, k));
                    max_div = max_div.max(div.abs());
                }
            }
        }
        assert!(max_div < 1e-3, "max divergence {}", max_div);
    }

    #[test]
    fn test_solve_is_deterministic() {
        let (n, dx) = (8, 0.5);
        let solid = open_solid(n, n, n, dx);
        let mut weights = WeightGrid::new(n, n, n);
        weights.calculate(&solid);
        let liquid = fluid_block(n, n, n, dx, (1, 1, 1), (7, 7, 7));

        let run = || {
            let mut field = MacVelocityField::new(n, n, n, dx);
            for idx in 0..field.v.len() {
                field.v.data_mut()[idx] = -1.0 - 0.01 * (idx % 7) as f32;
            }
            let mut valid = ValidVelocityGrid::new(n, n, n);
            let mut pressure = Array3d::new(n, n, n, 0.0f32);
            let params = PressureSolverParams {
                delta_time: 1.0 / 60.0,
                density: 1000.0,
                tolerance: 1e-9,
                acceptable_tolerance: 1e-4,
                max_iterations: 300,
                liquid_sdf: &liquid,
                solid_sdf: &solid,
                weights: &weights,
                surface_tension: None,
            };
            solve_pressure(&params, &mut field, &mut valid, &mut pressure);
            (field.u.data().to_vec(), field.v.data().to_vec())
        };

        let (u1, v1) = run();
        let (u2, v2) = run();
        assert_eq!(u1, u2);
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_cluster_classification_marks_small_droplets() {
        let (n, dx) = (8, 1.0);
        let mut liquid = ParticleLevelSet::new(n, n, n, dx);
        // Single fluid cell: a droplet below any reasonable threshold
        liquid.phi.set(4, 4, 4, -0.1);

        let status = classify_tension_clusters(&liquid, 5);
        assert!(status.get(4, 4, 4) == ClusterStatus::Bad);
        // The air region is huge, so it stays Ok
        assert!(status.get(0, 0, 0) == ClusterStatus::Ok);
    }
}

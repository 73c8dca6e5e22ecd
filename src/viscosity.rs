//! Variational implicit viscosity solve over face-aligned unknowns.
//!
//! Solves `(I - dt/rho * div(2 mu D)) u* = u` with `D` the symmetric
//! velocity gradient, following Batty and Bridson's free-surface
//! formulation: liquid volume fractions are estimated on a 2x subcell
//! lattice and accumulated onto cell-center, face, and edge control
//! volumes; rows couple the three face-velocity families.

use glam::Vec3;

use crate::array3d::Array3d;
use crate::grid::MacVelocityField;
use crate::levelset::{cube_volume_fraction, MeshLevelSet, ParticleLevelSet};
use crate::pcg::{solve_pcg, SolverStatus, SparseMatrix};

/// Face classification for the viscosity stencils.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FaceState {
    Air,
    Fluid,
    Solid,
}

/// Inputs to [`apply_viscosity`].
pub struct ViscositySolverParams<'a> {
    pub delta_time: f32,
    /// Cell-centered dynamic viscosity, constant or particle-sourced.
    pub viscosity: &'a Array3d<f32>,
    pub liquid_sdf: &'a ParticleLevelSet,
    pub solid_sdf: &'a MeshLevelSet,
    pub error_tolerance: f64,
    pub acceptable_tolerance: f64,
    pub max_iterations: usize,
}

struct FaceStateGrid {
    u: Array3d<FaceState>,
    v: Array3d<FaceState>,
    w: Array3d<FaceState>,
}

/// Liquid volume fractions on the control volumes of the variational
/// stencil.
struct VolumeGrid {
    center: Array3d<f32>,
    u: Array3d<f32>,
    v: Array3d<f32>,
    w: Array3d<f32>,
    edge_u: Array3d<f32>,
    edge_v: Array3d<f32>,
    edge_w: Array3d<f32>,
}

impl VolumeGrid {
    fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            center: Array3d::new(width, height, depth, 0.0),
            u: Array3d::new(width + 1, height, depth, 0.0),
            v: Array3d::new(width, height + 1, depth, 0.0),
            w: Array3d::new(width, height, depth + 1, 0.0),
            edge_u: Array3d::new(width, height + 1, depth + 1, 0.0),
            edge_v: Array3d::new(width + 1, height, depth + 1, 0.0),
            edge_w: Array3d::new(width + 1, height + 1, depth, 0.0),
        }
    }
}

/// Flat unknown indices: U faces, then V faces, then W faces.
struct MatrixIndexer {
    u: Array3d<i32>,
    v: Array3d<i32>,
    w: Array3d<i32>,
    matrix_size: usize,
}

/// Apply implicit viscous stresses to the velocity field in place.
pub fn apply_viscosity(
    params: &ViscositySolverParams,
    field: &mut MacVelocityField,
) -> SolverStatus {
    let state = compute_face_state_grid(params, field);
    let volumes = compute_volume_grid(params, field);
    let indexer = compute_matrix_index_table(field, &state, &volumes);

    if indexer.matrix_size == 0 {
        return SolverStatus {
            success: true,
            partial_success: false,
            iterations: 0,
            error: 0.0,
        };
    }

    let mut matrix = SparseMatrix::new(indexer.matrix_size, 15);
    let mut rhs = vec![0.0f64; indexer.matrix_size];
    initialize_linear_system(params, field, &state, &volumes, &indexer, &mut matrix, &mut rhs);

    let mut solution = vec![0.0f64; indexer.matrix_size];
    let result = solve_pcg(
        &matrix,
        &rhs,
        &mut solution,
        params.error_tolerance,
        params.max_iterations,
    );
    let status = SolverStatus::from_result(result, params.max_iterations, params.acceptable_tolerance);

    apply_solution_to_velocity_field(field, &indexer, &solution);
    status
}

fn compute_face_state_grid(params: &ViscositySolverParams, field: &MacVelocityField) -> FaceStateGrid {
    let (width, height, depth) = (field.width, field.height, field.depth);
    let solid = params.solid_sdf;

    let mut center_phi = Array3d::new(width, height, depth, 0.0f32);
    for k in 0..depth {
        for j in 0..height {
            for i in 0..width {
                center_phi.set(i, j, k, solid.distance_at_cell_center(i, j, k));
            }
        }
    }

    let mut state = FaceStateGrid {
        u: Array3d::new(width + 1, height, depth, FaceState::Air),
        v: Array3d::new(width, height + 1, depth, FaceState::Air),
        w: Array3d::new(width, height, depth + 1, FaceState::Air),
    };

    for k in 0..depth {
        for j in 0..height {
            for i in 0..=width {
                let is_edge = i == 0 || i == width;
                let solid_face = is_edge
                    || center_phi.get_clamped(i as i32 - 1, j as i32, k as i32)
                        + center_phi.get_clamped(i as i32, j as i32, k as i32)
                        <= 0.0;
                state.u.set(
                    i,
                    j,
                    k,
                    if solid_face { FaceState::Solid } else { FaceState::Fluid },
                );
            }
        }
    }

    for k in 0..depth {
        for j in 0..=height {
            for i in 0..width {
                let is_edge = j == 0 || j == height;
                let solid_face = is_edge
                    || center_phi.get_clamped(i as i32, j as i32 - 1, k as i32)
                        + center_phi.get_clamped(i as i32, j as i32, k as i32)
                        <= 0.0;
                state.v.set(
                    i,
                    j,
                    k,
                    if solid_face { FaceState::Solid } else { FaceState::Fluid },
                );
            }
        }
    }

    for k in 0..=depth {
        for j in 0..height {
            for i in 0..width {
                let is_edge = k == 0 || k == depth;
                let solid_face = is_edge
                    || center_phi.get_clamped(i as i32, j as i32, k as i32 - 1)
                        + center_phi.get_clamped(i as i32, j as i32, k as i32)
                        <= 0.0;
                state.w.set(
                    i,
                    j,
                    k,
                    if solid_face { FaceState::Solid } else { FaceState::Fluid },
                );
            }
        }
    }

    state
}

fn compute_volume_grid(params: &ViscositySolverParams, field: &MacVelocityField) -> VolumeGrid {
    let (width, height, depth) = (field.width, field.height, field.depth);
    let dx = field.cell_size;
    let liquid = params.liquid_sdf;

    // Cells near liquid, dilated two layers
    let mut valid_cells = Array3d::new(width + 1, height + 1, depth + 1, false);
    for k in 0..depth {
        for j in 0..height {
            for i in 0..width {
                if liquid.is_cell_fluid(i, j, k) {
                    valid_cells.set(i, j, k, true);
                }
            }
        }
    }
    for _ in 0..2 {
        let snapshot = valid_cells.clone();
        for k in 0..=depth {
            for j in 0..=height {
                for i in 0..=width {
                    if snapshot.get(i, j, k) {
                        for n in crate::array3d::GridIndex::new(i as i32, j as i32, k as i32)
                            .neighbours6()
                        {
                            if valid_cells.in_bounds(n.i, n.j, n.k) {
                                valid_cells.set(n.i as usize, n.j as usize, n.k as usize, true);
                            }
                        }
                    }
                }
            }
        }
    }

    // Liquid volume fractions on a 2x subcell lattice
    let mut subcell = Array3d::new(2 * width, 2 * height, 2 * depth, 0.0f32);
    let sub_dx = 0.5 * dx;
    let quarter = 0.25 * dx;
    for k in 0..2 * depth {
        for j in 0..2 * height {
            for i in 0..2 * width {
                if !valid_cells.get(i / 2, j / 2, k / 2) {
                    continue;
                }
                let center = Vec3::new(
                    quarter + i as f32 * sub_dx,
                    quarter + j as f32 * sub_dx,
                    quarter + k as f32 * sub_dx,
                );
                let h = 0.5 * sub_dx;
                let mut corners = [0.0f32; 8];
                for dk in 0..2 {
                    for dj in 0..2 {
                        for di in 0..2 {
                            let offset = Vec3::new(
                                if di == 0 { -h } else { h },
                                if dj == 0 { -h } else { h },
                                if dk == 0 { -h } else { h },
                            );
                            corners[dk * 4 + dj * 2 + di] =
                                liquid.trilinear_interpolate(center + offset);
                        }
                    }
                }
                subcell.set(i, j, k, cube_volume_fraction(corners));
            }
        }
    }

    // Accumulate 2x2x2 subcell blocks onto each control volume
    let mut volumes = VolumeGrid::new(width, height, depth);
    let mut accumulate = |grid: &mut Array3d<f32>, offset: (i32, i32, i32)| {
        for k in 1..depth {
            for j in 1..height {
                for i in 1..width {
                    if !valid_cells.get(i, j, k) {
                        continue;
                    }
                    let base_i = 2 * i as i32 + offset.0;
                    let base_j = 2 * j as i32 + offset.1;
                    let base_k = 2 * k as i32 + offset.2;
                    let mut sum = 0.0;
                    for dk in 0..2 {
                        for dj in 0..2 {
                            for di in 0..2 {
                                sum += subcell.get_clamped(base_i + di, base_j + dj, base_k + dk);
                            }
                        }
                    }
                    grid.set(i, j, k, 0.125 * sum);
                }
            }
        }
    };

    accumulate(&mut volumes.center, (0, 0, 0));
    accumulate(&mut volumes.u, (-1, 0, 0));
    accumulate(&mut volumes.v, (0, -1, 0));
    accumulate(&mut volumes.w, (0, 0, -1));
    accumulate(&mut volumes.edge_u, (0, -1, -1));
    accumulate(&mut volumes.edge_v, (-1, 0, -1));
    accumulate(&mut volumes.edge_w, (-1, -1, 0));

    volumes
}

fn compute_matrix_index_table(
    field: &MacVelocityField,
    state: &FaceStateGrid,
    volumes: &VolumeGrid,
) -> MatrixIndexer {
    let (width, height, depth) = (field.width, field.height, field.depth);
    let mut indexer = MatrixIndexer {
        u: Array3d::new(width + 1, height, depth, -1),
        v: Array3d::new(width, height + 1, depth, -1),
        w: Array3d::new(width, height, depth + 1, -1),
        matrix_size: 0,
    };

    let mut next = 0i32;
    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                if state.u.get(i, j, k) != FaceState::Fluid {
                    continue;
                }
                let touched = volumes.u.get(i, j, k) > 0.0
                    || volumes.center.get(i, j, k) > 0.0
                    || volumes.center.get(i - 1, j, k) > 0.0
                    || volumes.edge_w.get(i, j + 1, k) > 0.0
                    || volumes.edge_w.get(i, j, k) > 0.0
                    || volumes.edge_v.get(i, j, k + 1) > 0.0
                    || volumes.edge_v.get(i, j, k) > 0.0;
                if touched {
                    indexer.u.set(i, j, k, next);
                    next += 1;
                }
            }
        }
    }

    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                if state.v.get(i, j, k) != FaceState::Fluid {
                    continue;
                }
                let touched = volumes.v.get(i, j, k) > 0.0
                    || volumes.edge_w.get(i + 1, j, k) > 0.0
                    || volumes.edge_w.get(i, j, k) > 0.0
                    || volumes.center.get(i, j, k) > 0.0
                    || volumes.center.get(i, j - 1, k) > 0.0
                    || volumes.edge_u.get(i, j, k + 1) > 0.0
                    || volumes.edge_u.get(i, j, k) > 0.0;
                if touched {
                    indexer.v.set(i, j, k, next);
                    next += 1;
                }
            }
        }
    }

    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                if state.w.get(i, j, k) != FaceState::Fluid {
                    continue;
                }
                let touched = volumes.w.get(i, j, k) > 0.0
                    || volumes.edge_v.get(i + 1, j, k) > 0.0
                    || volumes.edge_v.get(i, j, k) > 0.0
                    || volumes.edge_u.get(i, j + 1, k) > 0.0
                    || volumes.edge_u.get(i, j, k) > 0.0
                    || volumes.center.get(i, j, k) > 0.0
                    || volumes.center.get(i, j, k - 1) > 0.0;
                if touched {
                    indexer.w.set(i, j, k, next);
                    next += 1;
                }
            }
        }
    }

    indexer.matrix_size = next as usize;
    indexer
}

/// Couple a stencil row to a neighbouring face unknown: fluid faces add
/// a matrix coefficient, solid faces fold their known velocity into the
/// right-hand side, and air or out-of-range faces contribute nothing.
#[allow(clippy::too_many_arguments)]
fn couple_term(
    state: &Array3d<FaceState>,
    index: &Array3d<i32>,
    velocity: &Array3d<f32>,
    matrix: &mut SparseMatrix,
    rval: &mut f64,
    row: usize,
    ni: i32,
    nj: i32,
    nk: i32,
    coeff: f64,
) {
    if !state.in_bounds(ni, nj, nk) {
        return;
    }
    let (ui, uj, uk) = (ni as usize, nj as usize, nk as usize);
    match state.get(ui, uj, uk) {
        FaceState::Fluid => {
            let col = index.get(ui, uj, uk);
            if col >= 0 {
                matrix.add(row, col as usize, coeff);
            }
        }
        FaceState::Solid => *rval -= coeff * velocity.get(ui, uj, uk) as f64,
        FaceState::Air => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn initialize_linear_system(
    params: &ViscositySolverParams,
    field: &MacVelocityField,
    state: &FaceStateGrid,
    volumes: &VolumeGrid,
    indexer: &MatrixIndexer,
    matrix: &mut SparseMatrix,
    rhs: &mut [f64],
) {
    let (width, height, depth) = (field.width, field.height, field.depth);
    let dx = field.cell_size as f64;
    let factor = params.delta_time as f64 / (dx * dx);
    let visc = params.viscosity;

    let mu = |i: i32, j: i32, k: i32| visc.get_clamped(i, j, k) as f64;

    // U rows
    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                let row = indexer.u.get(i, j, k);
                if state.u.get(i, j, k) != FaceState::Fluid || row < 0 {
                    continue;
                }
                let row = row as usize;
                let (i_, j_, k_) = (i as i32, j as i32, k as i32);

                let visc_right = mu(i_, j_, k_);
                let visc_left = mu(i_ - 1, j_, k_);
                let visc_top = 0.25
                    * (mu(i_ - 1, j_ + 1, k_) + mu(i_ - 1, j_, k_) + mu(i_, j_ + 1, k_) + mu(i_, j_, k_));
                let visc_bottom = 0.25
                    * (mu(i_ - 1, j_, k_) + mu(i_ - 1, j_ - 1, k_) + mu(i_, j_, k_) + mu(i_, j_ - 1, k_));
                let visc_front = 0.25
                    * (mu(i_ - 1, j_, k_ + 1) + mu(i_ - 1, j_, k_) + mu(i_, j_, k_ + 1) + mu(i_, j_, k_));
                let visc_back = 0.25
                    * (mu(i_ - 1, j_, k_) + mu(i_ - 1, j_, k_ - 1) + mu(i_, j_, k_) + mu(i_, j_, k_ - 1));

                let vol_right = volumes.center.get(i, j, k) as f64;
                let vol_left = volumes.center.get(i - 1, j, k) as f64;
                let vol_top = volumes.edge_w.get(i, j + 1, k) as f64;
                let vol_bottom = volumes.edge_w.get(i, j, k) as f64;
                let vol_front = volumes.edge_v.get(i, j, k + 1) as f64;
                let vol_back = volumes.edge_v.get(i, j, k) as f64;

                let factor_right = 2.0 * factor * visc_right * vol_right;
                let factor_left = 2.0 * factor * visc_left * vol_left;
                let factor_top = factor * visc_top * vol_top;
                let factor_bottom = factor * visc_bottom * vol_bottom;
                let factor_front = factor * visc_front * vol_front;
                let factor_back = factor * visc_back * vol_back;

                let diag = volumes.u.get(i, j, k) as f64
                    + factor_right
                    + factor_left
                    + factor_top
                    + factor_bottom
                    + factor_front
                    + factor_back;
                matrix.set(row, row, diag);

                let mut rval = volumes.u.get(i, j, k) as f64 * field.u.get(i, j, k) as f64;

                let u_terms = [
                    (i_ + 1, j_, k_, -factor_right),
                    (i_ - 1, j_, k_, -factor_left),
                    (i_, j_ + 1, k_, -factor_top),
                    (i_, j_ - 1, k_, -factor_bottom),
                    (i_, j_, k_ + 1, -factor_front),
                    (i_, j_, k_ - 1, -factor_back),
                ];
                for (ni, nj, nk, coeff) in u_terms {
                    couple_term(&state.u, &indexer.u, &field.u, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let v_terms = [
                    (i_, j_ + 1, k_, -factor_top),
                    (i_ - 1, j_ + 1, k_, factor_top),
                    (i_, j_, k_, factor_bottom),
                    (i_ - 1, j_, k_, -factor_bottom),
                ];
                for (ni, nj, nk, coeff) in v_terms {
                    couple_term(&state.v, &indexer.v, &field.v, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let w_terms = [
                    (i_, j_, k_ + 1, -factor_front),
                    (i_ - 1, j_, k_ + 1, factor_front),
                    (i_, j_, k_, factor_back),
                    (i_ - 1, j_, k_, -factor_back),
                ];
                for (ni, nj, nk, coeff) in w_terms {
                    couple_term(&state.w, &indexer.w, &field.w, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                rhs[row] = rval;
            }
        }
    }

    // V rows
    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                let row = indexer.v.get(i, j, k);
                if state.v.get(i, j, k) != FaceState::Fluid || row < 0 {
                    continue;
                }
                let row = row as usize;
                let (i_, j_, k_) = (i as i32, j as i32, k as i32);

                let visc_right = 0.25
                    * (mu(i_, j_ - 1, k_) + mu(i_ + 1, j_ - 1, k_) + mu(i_, j_, k_) + mu(i_ + 1, j_, k_));
                let visc_left = 0.25
                    * (mu(i_, j_ - 1, k_) + mu(i_ - 1, j_ - 1, k_) + mu(i_, j_, k_) + mu(i_ - 1, j_, k_));
                let visc_top = mu(i_, j_, k_);
                let visc_bottom = mu(i_, j_ - 1, k_);
                let visc_front = 0.25
                    * (mu(i_, j_ - 1, k_) + mu(i_, j_ - 1, k_ + 1) + mu(i_, j_, k_) + mu(i_, j_, k_ + 1));
                let visc_back = 0.25
                    * (mu(i_, j_ - 1, k_) + mu(i_, j_ - 1, k_ - 1) + mu(i_, j_, k_) + mu(i_, j_, k_ - 1));

                let vol_right = volumes.edge_w.get(i + 1, j, k) as f64;
                let vol_left = volumes.edge_w.get(i, j, k) as f64;
                let vol_top = volumes.center.get(i, j, k) as f64;
                let vol_bottom = volumes.center.get(i, j - 1, k) as f64;
                let vol_front = volumes.edge_u.get(i, j, k + 1) as f64;
                let vol_back = volumes.edge_u.get(i, j, k) as f64;

                let factor_right = factor * visc_right * vol_right;
                let factor_left = factor * visc_left * vol_left;
                let factor_top = 2.0 * factor * visc_top * vol_top;
                let factor_bottom = 2.0 * factor * visc_bottom * vol_bottom;
                let factor_front = factor * visc_front * vol_front;
                let factor_back = factor * visc_back * vol_back;

                let diag = volumes.v.get(i, j, k) as f64
                    + factor_right
                    + factor_left
                    + factor_top
                    + factor_bottom
                    + factor_front
                    + factor_back;
                matrix.set(row, row, diag);

                let mut rval = volumes.v.get(i, j, k) as f64 * field.v.get(i, j, k) as f64;

                let v_terms = [
                    (i_ + 1, j_, k_, -factor_right),
                    (i_ - 1, j_, k_, -factor_left),
                    (i_, j_ + 1, k_, -factor_top),
                    (i_, j_ - 1, k_, -factor_bottom),
                    (i_, j_, k_ + 1, -factor_front),
                    (i_, j_, k_ - 1, -factor_back),
                ];
                for (ni, nj, nk, coeff) in v_terms {
                    couple_term(&state.v, &indexer.v, &field.v, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let u_terms = [
                    (i_ + 1, j_, k_, -factor_right),
                    (i_ + 1, j_ - 1, k_, factor_right),
                    (i_, j_, k_, factor_left),
                    (i_, j_ - 1, k_, -factor_left),
                ];
                for (ni, nj, nk, coeff) in u_terms {
                    couple_term(&state.u, &indexer.u, &field.u, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let w_terms = [
                    (i_, j_, k_ + 1, -factor_front),
                    (i_, j_ - 1, k_ + 1, factor_front),
                    (i_, j_, k_, factor_back),
                    (i_, j_ - 1, k_, -factor_back),
                ];
                for (ni, nj, nk, coeff) in w_terms {
                    couple_term(&state.w, &indexer.w, &field.w, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                rhs[row] = rval;
            }
        }
    }

    // W rows
    for k in 1..depth {
        for j in 1..height {
            for i in 1..width {
                let row = indexer.w.get(i, j, k);
                if state.w.get(i, j, k) != FaceState::Fluid || row < 0 {
                    continue;
                }
                let row = row as usize;
                let (i_, j_, k_) = (i as i32, j as i32, k as i32);

                let visc_right = 0.25
                    * (mu(i_, j_, k_) + mu(i_, j_, k_ - 1) + mu(i_ + 1, j_, k_) + mu(i_ + 1, j_, k_ - 1));
                let visc_left = 0.25
                    * (mu(i_, j_, k_) + mu(i_, j_, k_ - 1) + mu(i_ - 1, j_, k_) + mu(i_ - 1, j_, k_ - 1));
                let visc_top = 0.25
                    * (mu(i_, j_, k_) + mu(i_, j_, k_ - 1) + mu(i_, j_ + 1, k_) + mu(i_, j_ + 1, k_ - 1));
                let visc_bottom = 0.25
                    * (mu(i_, j_, k_) + mu(i_, j_, k_ - 1) + mu(i_, j_ - 1, k_) + mu(i_, j_ - 1, k_ - 1));
                let visc_front = mu(i_, j_, k_);
                let visc_back = mu(i_, j_, k_ - 1);

                let vol_right = volumes.edge_v.get(i + 1, j, k) as f64;
                let vol_left = volumes.edge_v.get(i, j, k) as f64;
                let vol_top = volumes.edge_u.get(i, j + 1, k) as f64;
                let vol_bottom = volumes.edge_u.get(i, j, k) as f64;
                let vol_front = volumes.center.get(i, j, k) as f64;
                let vol_back = volumes.center.get(i, j, k - 1) as f64;

                let factor_right = factor * visc_right * vol_right;
                let factor_left = factor * visc_left * vol_left;
                let factor_top = factor * visc_top * vol_top;
                let factor_bottom = factor * visc_bottom * vol_bottom;
                let factor_front = 2.0 * factor * visc_front * vol_front;
                let factor_back = 2.0 * factor * visc_back * vol_back;

                let diag = volumes.w.get(i, j, k) as f64
                    + factor_right
                    + factor_left
                    + factor_top
                    + factor_bottom
                    + factor_front
                    + factor_back;
                matrix.set(row, row, diag);

                let mut rval = volumes.w.get(i, j, k) as f64 * field.w.get(i, j, k) as f64;

                let w_terms = [
                    (i_ + 1, j_, k_, -factor_right),
                    (i_ - 1, j_, k_, -factor_left),
                    (i_, j_ + 1, k_, -factor_top),
                    (i_, j_ - 1, k_, -factor_bottom),
                    (i_, j_, k_ + 1, -factor_front),
                    (i_, j_, k_ - 1, -factor_back),
                ];
                for (ni, nj, nk, coeff) in w_terms {
                    couple_term(&state.w, &indexer.w, &field.w, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let u_terms = [
                    (i_ + 1, j_, k_, -factor_right),
                    (i_ + 1, j_, k_ - 1, factor_right),
                    (i_, j_, k_, factor_left),
                    (i_, j_, k_ - 1, -factor_left),
                ];
                for (ni, nj, nk, coeff) in u_terms {
                    couple_term(&state.u, &indexer.u, &field.u, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                let v_terms = [
                    (i_, j_ + 1, k_, -factor_top),
                    (i_, j_ + 1, k_ - 1, factor_top),
                    (i_, j_, k_, factor_bottom),
                    (i_, j_, k_ - 1, -factor_bottom),
                ];
                for (ni, nj, nk, coeff) in v_terms {
                    couple_term(&state.v, &indexer.v, &field.v, matrix, &mut rval, row, ni, nj, nk, coeff);
                }

                rhs[row] = rval;
            }
        }
    }
}

fn apply_solution_to_velocity_field(
    field: &mut MacVelocityField,
    indexer: &MatrixIndexer,
    solution: &[f64],
) {
    for idx in 0..field.u.len() {
        let mat = indexer.u.data()[idx];
        if mat >= 0 {
            field.u.data_mut()[idx] = solution[mat as usize] as f32;
        }
    }
    for idx in 0..field.v.len() {
        let mat = indexer.v.data()[idx];
        if mat >= 0 {
            field.v.data_mut()[idx] = solution[mat as usize] as f32;
        }
    }
    for idx in 0..field.w.len() {
        let mat = indexer.w.data()[idx];
        if mat >= 0 {
            field.w.data_mut()[idx] = solution[mat as usize] as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(n: usize, dx: f32) -> (MeshLevelSet, ParticleLevelSet, Array3d<f32>) {
        let mut solid = MeshLevelSet::new(n, n, n, dx);
        solid.phi.fill(10.0 * dx);
        let mut liquid = ParticleLevelSet::new(n, n, n, dx);
        for k in 2..n - 2 {
            for j in 2..n - 2 {
                for i in 2..n - 2 {
                    liquid.phi.set(i, j, k, -dx);
                }
            }
        }
        let viscosity = Array3d::new(n, n, n, 5.0f32);
        (solid, liquid, viscosity)
    }

    #[test]
    fn test_uniform_velocity_is_preserved() {
        let (n, dx) = (10, 0.25);
        let (solid, liquid, viscosity) = setup(n, dx);
        let mut field = MacVelocityField::new(n, n, n, dx);
        field.u.fill(1.0);

        let params = ViscositySolverParams {
            delta_time: 1.0 / 60.0,
            viscosity: &viscosity,
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            error_tolerance: 1e-8,
            acceptable_tolerance: 1e-4,
            max_iterations: 500,
        };
        let status = apply_viscosity(&params, &mut field);
        assert!(status.success, "{:?}", status);

        // A constant field has no viscous stress; interior faces keep it
        let v = field.u.get(n / 2, n / 2, n / 2);
        assert!((v - 1.0).abs() < 1e-3, "u = {}", v);
    }

    #[test]
    fn test_shear_is_diffused() {
        let (n, dx) = (10, 0.25);
        let (solid, liquid, viscosity) = setup(n, dx);
        let mut field = MacVelocityField::new(n, n, n, dx);

        // Sharp shear layer: top half moves +x
        for k in 0..n {
            for j in 0..n {
                for i in 0..=n {
                    field.u.set(i, j, k, if j >= n / 2 { 1.0 } else { 0.0 });
                }
            }
        }
        let before_jump = field.u.get(n / 2, n / 2, n / 2) - field.u.get(n / 2, n / 2 - 1, n / 2);

        let params = ViscositySolverParams {
            delta_time: 1.0 / 30.0,
            viscosity: &viscosity,
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            error_tolerance: 1e-8,
            acceptable_tolerance: 1e-4,
            max_iterations: 500,
        };
        let status = apply_viscosity(&params, &mut field);
        assert!(status.acceptable(), "{:?}", status);

        let after_jump = field.u.get(n / 2, n / 2, n / 2) - field.u.get(n / 2, n / 2 - 1, n / 2);
        assert!(
            after_jump < before_jump,
            "shear should diffuse: {} -> {}",
            before_jump,
            after_jump
        );
    }

    #[test]
    fn test_empty_liquid_is_a_no_op() {
        let (n, dx) = (8, 0.25);
        let mut solid = MeshLevelSet::new(n, n, n, dx);
        solid.phi.fill(10.0 * dx);
        let liquid = ParticleLevelSet::new(n, n, n, dx);
        let viscosity = Array3d::new(n, n, n, 1.0f32);

        let mut field = MacVelocityField::new(n, n, n, dx);
        field.u.fill(2.0);
        let before = field.u.data().to_vec();

        let params = ViscositySolverParams {
            delta_time: 1.0 / 60.0,
            viscosity: &viscosity,
            liquid_sdf: &liquid,
            solid_sdf: &solid,
            error_tolerance: 1e-8,
            acceptable_tolerance: 1e-4,
            max_iterations: 100,
        };
        let status = apply_viscosity(&params, &mut field);
        assert!(status.success);
        assert_eq!(field.u.data(), &before[..]);
    }
}

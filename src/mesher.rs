//! The particle mesher seam.
//!
//! The output stage hands a liquid SDF to a [`ParticleMesher`] and gets
//! a triangle mesh back. The built-in implementation contours the zero
//! isosurface with a surface-nets style extraction: one vertex per
//! sign-crossing cell placed at the mean of its edge crossings, one
//! quad per sign-crossing lattice edge.

use glam::Vec3;
use rayon::prelude::*;

use crate::array3d::Array3d;
use crate::mesh::TriangleMesh;

/// Converts a liquid signed distance field into a triangle mesh.
pub trait ParticleMesher: Send + Sync {
    /// `sdf` is cell-centered with spacing `cell_size`; `subdivision`
    /// refines the contouring lattice; `slices` bounds the number of
    /// parallel sampling bands.
    fn mesh_surface(
        &self,
        sdf: &Array3d<f32>,
        cell_size: f32,
        subdivision: usize,
        slices: usize,
    ) -> TriangleMesh;
}

/// Built-in surface-nets contouring mesher.
#[derive(Default)]
pub struct SurfaceNetsMesher;

impl ParticleMesher for SurfaceNetsMesher {
    fn mesh_surface(
        &self,
        sdf: &Array3d<f32>,
        cell_size: f32,
        subdivision: usize,
        slices: usize,
    ) -> TriangleMesh {
        let s = subdivision.max(1);
        let h = cell_size / s as f32;
        let nw = sdf.width * s + 1;
        let nh = sdf.height * s + 1;
        let nd = sdf.depth * s + 1;

        // Sample the refined node lattice in parallel k-bands
        let bands = slices.clamp(1, nd);
        let mut samples = Array3d::new(nw, nh, nd, 0.0f32);
        let band_size = nd.div_ceil(bands);
        let rows: Vec<Vec<f32>> = (0..bands)
            .into_par_iter()
            .map(|band| {
                let k0 = band * band_size;
                let k1 = ((band + 1) * band_size).min(nd);
                let mut out = Vec::with_capacity((k1.saturating_sub(k0)) * nh * nw);
                for k in k0..k1 {
                    for j in 0..nh {
                        for i in 0..nw {
                            let p = Vec3::new(i as f32 * h, j as f32 * h, k as f32 * h);
                            out.push(sdf.interpolate_cell_centered(p, cell_size));
                        }
                    }
                }
                out
            })
            .collect();
        {
            let data = samples.data_mut();
            let mut offset = 0;
            for row in rows {
                data[offset..offset + row.len()].copy_from_slice(&row);
                offset += row.len();
            }
        }

        extract_surface_nets(&samples, h)
    }
}

/// Surface-nets extraction over a node lattice with spacing `h`.
fn extract_surface_nets(samples: &Array3d<f32>, h: f32) -> TriangleMesh {
    let (nw, nh, nd) = (samples.width, samples.height, samples.depth);
    let (cw, ch, cd) = (nw - 1, nh - 1, nd - 1);

    let mut mesh = TriangleMesh::new();
    let mut cell_vertex = Array3d::new(cw, ch, cd, -1i32);

    // Cube edges as corner-offset pairs
    const EDGES: [((usize, usize, usize), (usize, usize, usize)); 12] = [
        ((0, 0, 0), (1, 0, 0)),
        ((0, 1, 0), (1, 1, 0)),
        ((0, 0, 1), (1, 0, 1)),
        ((0, 1, 1), (1, 1, 1)),
        ((0, 0, 0), (0, 1, 0)),
        ((1, 0, 0), (1, 1, 0)),
        ((0, 0, 1), (0, 1, 1)),
        ((1, 0, 1), (1, 1, 1)),
        ((0, 0, 0), (0, 0, 1)),
        ((1, 0, 0), (1, 0, 1)),
        ((0, 1, 0), (0, 1, 1)),
        ((1, 1, 0), (1, 1, 1)),
    ];

    // One vertex per sign-crossing cell
    for k in 0..cd {
        for j in 0..ch {
            for i in 0..cw {
                let mut crossing_sum = Vec3::ZERO;
                let mut crossings = 0;
                for (a, b) in EDGES {
                    let pa = samples.get(i + a.0, j + a.1, k + a.2);
                    let pb = samples.get(i + b.0, j + b.1, k + b.2);
                    if (pa < 0.0) == (pb < 0.0) {
                        continue;
                    }
                    let t = pa / (pa - pb);
                    let na = Vec3::new((i + a.0) as f32, (j + a.1) as f32, (k + a.2) as f32);
                    let nb = Vec3::new((i + b.0) as f32, (j + b.1) as f32, (k + b.2) as f32);
                    crossing_sum += na + t * (nb - na);
                    crossings += 1;
                }
                if crossings > 0 {
                    cell_vertex.set(i, j, k, mesh.vertices.len() as i32);
                    mesh.vertices.push(crossing_sum / crossings as f32 * h);
                }
            }
        }
    }

    // One quad per sign-crossing interior lattice edge; winding follows
    // the sign direction so normals point out of the liquid
    let mut emit_quad = |verts: [i32; 4], flip: bool| {
        if verts.iter().any(|&v| v < 0) {
            return;
        }
        let [a, b, c, d] = verts.map(|v| v as u32);
        if flip {
            mesh.triangles.push([a, c, b]);
            mesh.triangles.push([a, d, c]);
        } else {
            mesh.triangles.push([a, b, c]);
            mesh.triangles.push([a, c, d]);
        }
    };

    // X-directed edges shared by cells (i, j-1..j, k-1..k)
    for k in 1..cd {
        for j in 1..ch {
            for i in 0..cw {
                let pa = samples.get(i, j, k);
                let pb = samples.get(i + 1, j, k);
                if (pa < 0.0) == (pb < 0.0) {
                    continue;
                }
                emit_quad(
                    [
                        cell_vertex.get(i, j - 1, k - 1),
                        cell_vertex.get(i, j, k - 1),
                        cell_vertex.get(i, j, k),
                        cell_vertex.get(i, j - 1, k),
                    ],
                    pa < 0.0,
                );
            }
        }
    }

    // Y-directed edges shared by cells (i-1..i, j, k-1..k)
    for k in 1..cd {
        for j in 0..ch {
            for i in 1..cw {
                let pa = samples.get(i, j, k);
                let pb = samples.get(i, j + 1, k);
                if (pa < 0.0) == (pb < 0.0) {
                    continue;
                }
                emit_quad(
                    [
                        cell_vertex.get(i - 1, j, k - 1),
                        cell_vertex.get(i, j, k - 1),
                        cell_vertex.get(i, j, k),
                        cell_vertex.get(i - 1, j, k),
                    ],
                    pa >= 0.0,
                );
            }
        }
    }

    // Z-directed edges shared by cells (i-1..i, j-1..j, k)
    for k in 0..cd {
        for j in 1..ch {
            for i in 1..cw {
                let pa = samples.get(i, j, k);
                let pb = samples.get(i, j, k + 1);
                if (pa < 0.0) == (pb < 0.0) {
                    continue;
                }
                emit_quad(
                    [
                        cell_vertex.get(i - 1, j - 1, k),
                        cell_vertex.get(i, j - 1, k),
                        cell_vertex.get(i, j, k),
                        cell_vertex.get(i - 1, j, k),
                    ],
                    pa < 0.0,
                );
            }
        }
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_sdf(n: usize, dx: f32, center: Vec3, radius: f32) -> Array3d<f32> {
        let mut sdf = Array3d::new(n, n, n, 10.0f32);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let p = Vec3::new(
                        (i as f32 + 0.5) * dx,
                        (j as f32 + 0.5) * dx,
                        (k as f32 + 0.5) * dx,
                    );
                    sdf.set(i, j, k, (p - center).length() - radius);
                }
            }
        }
        sdf
    }

    #[test]
    fn test_sphere_produces_closed_surface() {
        let (n, dx) = (16, 0.25);
        let sdf = sphere_sdf(n, dx, Vec3::splat(2.0), 1.0);
        let mesh = SurfaceNetsMesher.mesh_surface(&sdf, dx, 1, 1);

        assert!(!mesh.is_empty());
        // All vertices lie close to the sphere
        for v in &mesh.vertices {
            let r = (*v - Vec3::splat(2.0)).length();
            assert!((r - 1.0).abs() < 0.4, "vertex at radius {}", r);
        }
    }

    #[test]
    fn test_empty_sdf_produces_no_mesh() {
        let sdf = Array3d::new(8, 8, 8, 5.0f32);
        let mesh = SurfaceNetsMesher.mesh_surface(&sdf, 0.5, 1, 1);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_subdivision_refines_mesh() {
        let (n, dx) = (8, 0.5);
        let sdf = sphere_sdf(n, dx, Vec3::splat(2.0), 1.0);
        let coarse = SurfaceNetsMesher.mesh_surface(&sdf, dx, 1, 1);
        let fine = SurfaceNetsMesher.mesh_surface(&sdf, dx, 2, 1);
        assert!(fine.triangle_count() > 2 * coarse.triangle_count());
    }

    #[test]
    fn test_slices_do_not_change_output() {
        let (n, dx) = (8, 0.5);
        let sdf = sphere_sdf(n, dx, Vec3::splat(2.0), 1.0);
        let one = SurfaceNetsMesher.mesh_surface(&sdf, dx, 1, 1);
        let four = SurfaceNetsMesher.mesh_surface(&sdf, dx, 1, 4);
        assert_eq!(one.vertices.len(), four.vertices.len());
        assert_eq!(one.triangles, four.triangles);
    }
}

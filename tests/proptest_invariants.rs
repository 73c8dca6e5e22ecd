//! Property-based invariants for the particle store, sub-cell mask,
//! and field extrapolation.

use glam::Vec3;
use proptest::prelude::*;
use undertow::array3d::{extrapolate_layers, Array3d};
use undertow::particles::{ParticleStore, ATTR_POSITION, ATTR_VELOCITY};
use undertow::sources::ParticleMaskGrid;

fn vec3_strategy(limit: f32) -> impl Strategy<Value = Vec3> {
    (0.0..limit, 0.0..limit, 0.0..limit).prop_map(|(x, y, z)| Vec3::new(x, y, z))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_columns_share_length_after_any_growth(
        positions in prop::collection::vec(vec3_strategy(4.0), 0..64),
        extra_velocities in prop::collection::vec(vec3_strategy(2.0), 0..16),
    ) {
        let mut store = ParticleStore::new();
        store.add_attribute_vec3(ATTR_POSITION, Vec3::ZERO).unwrap();
        store.add_attribute_vec3(ATTR_VELOCITY, Vec3::ZERO).unwrap();
        store.add_attribute_float("MASS", 1.0).unwrap();

        store.vec3_values_mut(ATTR_POSITION).unwrap().extend(positions);
        store.vec3_values_mut(ATTR_VELOCITY).unwrap().extend(extra_velocities);
        store.update();

        let n = store.len();
        prop_assert_eq!(store.vec3_values(ATTR_POSITION).unwrap().len(), n);
        prop_assert_eq!(store.vec3_values(ATTR_VELOCITY).unwrap().len(), n);
        prop_assert_eq!(store.float_values("MASS").unwrap().len(), n);
    }

    #[test]
    fn removal_preserves_relative_order(
        values in prop::collection::vec(0.0f32..100.0, 1..64),
        seed in 0u64..1000,
    ) {
        let mut store = ParticleStore::new();
        store.add_attribute_vec3(ATTR_POSITION, Vec3::ZERO).unwrap();
        store.add_attribute_float("TAG", 0.0).unwrap();
        store
            .vec3_values_mut(ATTR_POSITION)
            .unwrap()
            .extend(values.iter().map(|&v| Vec3::splat(v)));
        store.float_values_mut("TAG").unwrap().extend(values.iter().copied());
        store.update();

        // Pseudo-random removal mask
        let mask: Vec<bool> = (0..values.len())
            .map(|i| (seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64)) % 3 == 0)
            .collect();
        let expected: Vec<f32> = values
            .iter()
            .zip(&mask)
            .filter(|(_, &m)| !m)
            .map(|(&v, _)| v)
            .collect();

        store.remove_particles(&mask).unwrap();
        prop_assert_eq!(store.float_values("TAG").unwrap().clone(), expected);
    }

    #[test]
    fn mask_grid_set_then_query_is_idempotent(
        points in prop::collection::vec(vec3_strategy(3.9), 1..64),
    ) {
        let mut mask = ParticleMaskGrid::new(8, 8, 8, 0.5);
        for &p in &points {
            mask.set_sub_cell(p);
        }
        for &p in &points {
            prop_assert!(mask.is_sub_cell_set(p));
        }
    }

    #[test]
    fn extrapolation_is_deterministic(
        seeds in prop::collection::vec((0usize..6, 0usize..6, 0usize..6, -4.0f32..4.0), 1..12),
    ) {
        let run = || {
            let mut field = Array3d::new(6, 6, 6, 0.0f32);
            let mut valid = Array3d::new(6, 6, 6, false);
            for &(i, j, k, v) in &seeds {
                field.set(i, j, k, v);
                valid.set(i, j, k, true);
            }
            extrapolate_layers(&mut field, &mut valid, 3);
            field.data().to_vec()
        };
        prop_assert_eq!(run(), run());
    }
}

//! Multi-rank regression: a partitioned run must agree with the
//! single-rank reference up to floating-point reduction order, and
//! migration must conserve points and state.

use std::sync::Arc;

use otm_algebra::{Real, Vector};
use otm_element::constitutive::NeoHookean;
use otm_halo::{BalancePolicy, DistributedModel, LocalCluster};
use otm_model::builder::{BodySpec, ModelBuilder};
use otm_model::mesh::shapes;
use otm_model::Model;
use otm_solver::Clock;
use otm_traits::comm::RankComm;
use otm_traits::{MpId, Threading};

const ELEMENTS: usize = 40;
const LENGTH: Real = 1.0;

fn build_full_model() -> Model<1> {
    let h = LENGTH / ELEMENTS as Real;
    let c: Real = (210e9f64 / 7800.0).sqrt();
    let dt = 0.3 * h / c;
    let mut builder =
        ModelBuilder::<1>::new(Clock::new(dt), 3.2 * h).threading(Threading::Deterministic);
    builder
        .insert_body(BodySpec::new(
            shapes::bar(ELEMENTS, LENGTH),
            Arc::new(NeoHookean::from_youngs(210e9, 0.0)),
            7800.0,
        ))
        .unwrap();
    let mut model = builder.create_model().unwrap();
    // velocity pulse on the left fifth
    for slot in 0..model.dofs().len() {
        if model.dofs().position[slot][0] <= 0.2 * LENGTH + 1e-12 {
            model.dofs_mut().velocity[slot] = Vector([0.5]);
        }
    }
    model
}

/// Keep only the points in this rank's stripe and re-home the nodes by
/// the plurality of referencing stripes.
fn partition(model: &mut Model<1>, rank: usize, size: usize) {
    let stripe = LENGTH / size as Real;
    let not_mine: Vec<MpId> = model
        .material_points()
        .iter()
        .filter(|m| {
            let owner = ((m.position[0] / stripe).floor() as usize).min(size - 1);
            owner != rank
        })
        .map(|m| m.id)
        .collect();
    model.extract_points(&not_mine);

    for slot in 0..model.arena().len() {
        let x = model.dofs().position[slot][0];
        let home = ((x / stripe).floor() as usize).min(size - 1);
        model.arena_mut().set_home_rank(slot, home);
        model.arena_mut().set_shadow(slot, home != rank);
    }
    model.recompute_mass();
    model.update_detached_from_mass();
}

fn owned_state(d: &DistributedModel<1, impl RankComm>) -> Vec<(u64, Real, Real)> {
    let me = d.comm.rank();
    (0..d.model.arena().len())
        .filter(|&s| d.model.arena().home_rank(s) == me)
        .map(|s| {
            (
                d.model.arena().id(s).0,
                d.model.dofs().position[s][0],
                d.model.dofs().velocity[s][0],
            )
        })
        .collect()
}

#[test]
fn four_rank_run_matches_single_rank() {
    let steps = 60;

    // single-rank reference through the same code path
    let reference = LocalCluster::run(1, |comm| {
        let mut model = build_full_model();
        partition(&mut model, 0, 1);
        let mut d = DistributedModel::new(model, comm);
        for _ in 0..steps {
            d.step().unwrap();
        }
        let state = owned_state(&d);
        let energy = d.model.kinetic_energy() + d.model.strain_energy();
        (state, energy)
    })
    .remove(0);

    let distributed = LocalCluster::run(4, |comm| {
        let rank = comm.rank();
        let mut model = build_full_model();
        partition(&mut model, rank, 4);
        let mut d = DistributedModel::new(model, comm);
        for _ in 0..steps {
            d.step().unwrap();
        }
        let state = owned_state(&d);
        // energy over this rank's points only; summed across ranks
        let kinetic: Real = d
            .model
            .material_points()
            .iter()
            .filter(|m| m.active)
            .map(|m| {
                let mut v = 0.0;
                for e in &m.support {
                    let slot = d.model.arena().slot(e.node).unwrap();
                    v += e.weight * d.model.dofs().velocity[slot][0];
                }
                0.5 * m.mass * v * v
            })
            .sum();
        (state, kinetic + d.model.strain_energy())
    });

    // merge the owned states of all ranks and compare nodewise
    let mut merged: Vec<(u64, Real, Real)> = Vec::new();
    let mut total_energy = 0.0;
    for (state, energy) in distributed {
        merged.extend(state);
        total_energy += energy;
    }
    merged.sort_by_key(|(id, _, _)| *id);
    let mut reference_state = reference.0.clone();
    reference_state.sort_by_key(|(id, _, _)| *id);

    assert_eq!(merged.len(), reference_state.len());
    for ((id_a, x_a, v_a), (id_b, x_b, v_b)) in merged.iter().zip(&reference_state) {
        assert_eq!(id_a, id_b);
        assert!(
            (x_a - x_b).abs() <= 1e-12 * x_b.abs().max(1.0),
            "node {id_a}: position {x_a} vs {x_b}"
        );
        assert!(
            (v_a - v_b).abs() <= 1e-12 * v_b.abs().max(1.0),
            "node {id_a}: velocity {v_a} vs {v_b}"
        );
    }
    let rel = (total_energy - reference.1).abs() / reference.1.max(1e-30);
    assert!(rel <= 1e-3, "energy mismatch {rel}");
}

#[test]
fn migration_conserves_points_and_state() {
    let results = LocalCluster::run(2, |comm| {
        let rank = comm.rank();
        let mut model = build_full_model();
        // lopsided split: rank 0 gets 90%, rank 1 gets the right tail
        let not_mine: Vec<MpId> = model
            .material_points()
            .iter()
            .filter(|m| {
                let owner = if m.position[0] <= 0.9 { 0 } else { 1 };
                owner != rank
            })
            .map(|m| m.id)
            .collect();
        model.extract_points(&not_mine);
        for slot in 0..model.arena().len() {
            let x = model.dofs().position[slot][0];
            let home = if x <= 0.9 { 0 } else { 1 };
            model.arena_mut().set_home_rank(slot, home);
            model.arena_mut().set_shadow(slot, home != rank);
        }
        model.recompute_mass();
        model.update_detached_from_mass();

        let mut d = DistributedModel::new(model, comm);
        d.balancer.threshold = 0.2;
        d.balancer.policy = BalancePolicy::Greedy;
        d.step().unwrap();
        let before = d.model.material_points().len();
        let migrated_out = d.rebalance().unwrap();
        let after = d.model.material_points().len();
        // keep stepping after migration
        for _ in 0..5 {
            d.step().unwrap();
        }
        let mass: Real = d.model.mass();
        let lambdas_finite = d
            .model
            .material_points()
            .iter()
            .all(|m| m.lambda.is_finite());
        (rank, before, after, migrated_out, mass, lambdas_finite)
    });

    let total_before: usize = results.iter().map(|r| r.1).sum();
    let total_after: usize = results.iter().map(|r| r.2).sum();
    assert_eq!(total_before, ELEMENTS);
    assert_eq!(total_after, ELEMENTS, "migration lost or duplicated points");
    let moved: usize = results.iter().map(|r| r.3).sum();
    assert!(moved > 0, "no migration despite skewed costs");
    // the heavy rank shed work
    let r0_after = results.iter().find(|r| r.0 == 0).unwrap().2;
    let r0_before = results.iter().find(|r| r.0 == 0).unwrap().1;
    assert!(r0_after < r0_before);
    let total_mass: Real = results.iter().map(|r| r.4).sum();
    assert!((total_mass - 7800.0 * LENGTH).abs() <= 1e-9 * 7800.0);
    assert!(results.iter().all(|r| r.5));
}

#[test]
fn shadow_nodes_are_created_on_first_sight() {
    let mut model = build_full_model();
    let fresh_id = otm_traits::NodeId(10_000);
    let before = model.arena().len();
    let slot = model
        .ensure_node(
            fresh_id,
            otm_traits::CarrierId(0),
            3,
            None,
            Vector([2.0]),
        )
        .unwrap();
    assert_eq!(model.arena().len(), before + 1);
    assert!(model.arena().is_shadow(slot));
    assert_eq!(model.arena().home_rank(slot), 3);
}

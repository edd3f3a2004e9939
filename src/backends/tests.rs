use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rstest::*;

use crate::backends::{
    BackendFlags, BackendKind, BackendRegistry, BackendRequest, CoreError, LikelihoodCore,
    Operation, ReferenceCore, Rescale,
};
use crate::substitution_models::dna_models::{hky, jc69};
use crate::substitution_models::SubstModel;

fn request(tips: usize, states: usize, patterns: usize, categories: usize) -> BackendRequest {
    let nodes = 2 * tips - 1;
    BackendRequest {
        tip_count: tips,
        partial_buffer_count: nodes,
        matrix_buffer_count: nodes,
        eigen_buffer_count: 1,
        scale_buffer_count: nodes,
        state_count: states,
        pattern_count: patterns,
        category_count: categories,
        threads: 1,
        required_flags: BackendFlags::empty(),
        preferred_flags: BackendFlags::empty(),
    }
}

fn op(destination: usize, rescale: Option<Rescale>, child1: usize, child2: usize) -> Operation {
    Operation {
        destination,
        rescale,
        child1,
        child1_matrix: child1,
        child2,
        child2_matrix: child2,
    }
}

/// Three taxa, `((0,1)3,2)4`, one pattern per state combination listed.
fn three_taxon_core(model: &SubstModel, states: [&[usize]; 3], times: [f64; 4]) -> ReferenceCore {
    let patterns = states[0].len();
    let mut core = ReferenceCore::new(&request(3, 4, patterns, 1)).unwrap();
    for (tip, tip_states) in states.iter().enumerate() {
        core.set_tip_states(tip, tip_states).unwrap();
    }
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    core.update_transition_matrices(0, &[0, 1, 2, 3], &times)
        .unwrap();
    core
}

fn root_log_likelihoods(core: &mut dyn LikelihoodCore, model: &SubstModel, scale: &[usize], patterns: usize) -> Vec<f64> {
    let mut out = vec![0.0; patterns];
    core.calculate_root_log_likelihoods(4, &[1.0], model.freqs().as_slice(), scale, &mut out)
        .unwrap();
    out
}

#[test]
fn flags_from_lists() {
    let flags = BackendFlags::parse_list("cpu, auto|double").unwrap();
    assert_eq!(
        flags,
        BackendFlags::PROCESSOR_CPU | BackendFlags::SCALING_AUTO | BackendFlags::PRECISION_DOUBLE
    );
    assert_eq!(BackendFlags::parse_list("").unwrap(), BackendFlags::empty());
    assert_eq!("GPU".parse::<BackendFlags>().unwrap(), BackendFlags::PROCESSOR_GPU);
    assert!(BackendFlags::parse_list("cpu,quantum").is_err());
}

#[test]
fn backend_order_from_list() {
    assert_eq!(
        BackendKind::parse_order("reference, gpu,reference").unwrap(),
        vec![BackendKind::Reference, BackendKind::Gpu]
    );
    assert!(BackendKind::parse_order("fpga").is_err());
    assert_eq!(BackendKind::Native.to_string(), "native");
}

#[test]
fn operation_scale_views() {
    let write = op(4, Some(Rescale::Write(1)), 0, 1);
    assert_eq!((write.scale_write(), write.scale_read()), (Some(1), None));
    let read = op(4, Some(Rescale::Read { from: 1, to: 3 }), 0, 1);
    assert_eq!((read.scale_write(), read.scale_read()), (Some(3), Some(1)));
    let plain = op(4, None, 0, 1);
    assert_eq!((plain.scale_write(), plain.scale_read()), (None, None));
}

#[rstest]
#[case::one_category(&[1.0])]
#[case::three_categories(&[0.2, 1.0, 1.8])]
fn transition_matrices_are_stochastic(#[case] rates: &[f64]) {
    let model = hky(&[0.1, 0.2, 0.3, 0.4], 4.0).unwrap();
    let mut core = ReferenceCore::new(&request(2, 4, 1, rates.len())).unwrap();
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    core.set_category_rates(rates).unwrap();
    core.update_transition_matrices(0, &[0, 1], &[0.3, 7.5]).unwrap();
    let mut matrix = vec![0.0; rates.len() * 16];
    core.get_transition_matrix(0, &mut matrix).unwrap();
    for (c, rate) in rates.iter().enumerate() {
        let expected = model.p(0.3 * rate);
        for i in 0..4 {
            let row = &matrix[c * 16 + i * 4..c * 16 + (i + 1) * 4];
            assert_relative_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
            for j in 0..4 {
                assert!(row[j] >= 0.0);
                assert_relative_eq!(row[j], expected[(i, j)], epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn negative_branch_time_is_fatal() {
    let model = jc69().unwrap();
    let mut core = ReferenceCore::new(&request(2, 4, 1, 1)).unwrap();
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    let err = core
        .update_transition_matrices(0, &[0, 1], &[0.1, -0.1])
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::NegativeBranchTime(_))
    );
}

#[test]
fn missing_eigen_decomposition() {
    let mut core = ReferenceCore::new(&request(2, 4, 1, 1)).unwrap();
    let err = core.update_transition_matrices(0, &[0], &[0.1]).unwrap_err();
    assert_matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::Uninitialised { .. })
    );
}

#[test]
fn cherry_matches_pulley_principle() {
    // JC is reversible, the likelihood of a cherry only depends on the
    // summed branch length.
    let model = jc69().unwrap();
    let mut core = ReferenceCore::new(&request(2, 4, 2, 1)).unwrap();
    core.set_tip_states(0, &[0, 1]).unwrap();
    core.set_tip_states(1, &[0, 2]).unwrap();
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    core.update_transition_matrices(0, &[0, 1], &[0.1, 0.4]).unwrap();
    core.update_partials(&[op(2, None, 0, 1)]).unwrap();
    let mut out = vec![0.0; 2];
    core.calculate_root_log_likelihoods(2, &[1.0], &[0.25; 4], &[], &mut out)
        .unwrap();
    let p = model.p(0.5);
    assert_relative_eq!(out[0], (0.25 * p[(0, 0)]).ln(), epsilon = 1e-12);
    assert_relative_eq!(out[1], (0.25 * p[(1, 2)]).ln(), epsilon = 1e-12);
    core.set_pattern_weights(&[3.0, 1.0]).unwrap();
    assert_relative_eq!(
        core.sum_site_log_likelihoods(&out),
        3.0 * out[0] + out[1],
        epsilon = 1e-12
    );
}

#[test]
fn states_and_partials_agree() {
    let model = hky(&[0.1, 0.2, 0.3, 0.4], 2.0).unwrap();
    let states: [&[usize]; 3] = [&[0, 1, 4], &[2, 1, 3], &[3, 4, 0]];
    let times = [0.1, 0.2, 0.3, 0.05];
    let mut with_states = three_taxon_core(&model, states, times);
    let mut with_partials = three_taxon_core(&model, states, times);
    for (tip, tip_states) in states.iter().enumerate() {
        let partials: Vec<f64> = tip_states
            .iter()
            .flat_map(|&code| (0..4).map(move |s| if code == 4 || code == s { 1.0 } else { 0.0 }))
            .collect();
        with_partials.set_tip_partials(tip, &partials).unwrap();
    }
    let ops = [op(3, None, 0, 1), op(4, None, 3, 2)];
    with_states.update_partials(&ops).unwrap();
    with_partials.update_partials(&ops).unwrap();
    let a = root_log_likelihoods(&mut with_states, &model, &[], 3);
    let b = root_log_likelihoods(&mut with_partials, &model, &[], 3);
    crate::assert_float_relative_slice_eq(&a, &b, 1e-12);

    let mut expanded = vec![0.0; 12];
    with_states.get_partials(0, &mut expanded).unwrap();
    assert_eq!(&expanded[8..12], &[1.0; 4]);
}

#[test]
fn all_missing_site_has_likelihood_one() {
    let model = jc69().unwrap();
    let mut core = three_taxon_core(&model, [&[4], &[4], &[4]], [0.1, 0.2, 0.3, 0.05]);
    core.update_partials(&[op(3, None, 0, 1), op(4, None, 3, 2)])
        .unwrap();
    let out = root_log_likelihoods(&mut core, &model, &[], 1);
    assert_relative_eq!(out[0], 0.0, epsilon = 1e-12);
}

#[test]
fn scaling_leaves_likelihood_unchanged() {
    let model = jc69().unwrap();
    let states: [&[usize]; 3] = [&[0, 1, 2], &[0, 3, 2], &[1, 1, 2]];
    let times = [0.5, 0.2, 0.9, 0.1];
    let mut plain = three_taxon_core(&model, states, times);
    plain
        .update_partials(&[op(3, None, 0, 1), op(4, None, 3, 2)])
        .unwrap();
    let expected = root_log_likelihoods(&mut plain, &model, &[], 3);

    let mut scaled = three_taxon_core(&model, states, times);
    scaled
        .update_partials(&[
            op(3, Some(Rescale::Write(0)), 0, 1),
            op(4, Some(Rescale::Write(1)), 3, 2),
        ])
        .unwrap();
    let actual = root_log_likelihoods(&mut scaled, &model, &[0, 1], 3);
    crate::assert_float_relative_slice_eq(&actual, &expected, 1e-12);

    // reuse cached factors for the root, carried over into another buffer
    scaled
        .update_partials(&[op(4, Some(Rescale::Read { from: 1, to: 2 }), 3, 2)])
        .unwrap();
    let reused = root_log_likelihoods(&mut scaled, &model, &[0, 2], 3);
    crate::assert_float_relative_slice_eq(&reused, &expected, 1e-12);

    scaled
        .update_partials(&[op(3, Some(Rescale::Reset(0)), 0, 1), op(4, None, 3, 2)])
        .unwrap();
    let reset = root_log_likelihoods(&mut scaled, &model, &[0], 3);
    crate::assert_float_relative_slice_eq(&reset, &expected, 1e-12);
}

#[test]
fn auto_scaling_inside_core() {
    let model = jc69().unwrap();
    let states: [&[usize]; 3] = [&[0, 1], &[2, 1], &[3, 0]];
    let times = [0.5, 0.2, 0.9, 0.1];
    let mut plain = three_taxon_core(&model, states, times);
    plain
        .update_partials(&[op(3, None, 0, 1), op(4, None, 3, 2)])
        .unwrap();
    let expected = root_log_likelihoods(&mut plain, &model, &[], 2);

    let mut req = request(3, 4, 2, 1);
    req.preferred_flags = BackendFlags::SCALING_AUTO;
    let mut auto = ReferenceCore::new(&req).unwrap();
    assert!(auto.details().flags.contains(BackendFlags::SCALING_AUTO));
    for (tip, tip_states) in states.iter().enumerate() {
        auto.set_tip_states(tip, tip_states).unwrap();
    }
    auto.set_eigen_decomposition(0, model.eigen()).unwrap();
    auto.update_transition_matrices(0, &[0, 1, 2, 3], &times).unwrap();
    auto.update_partials(&[op(3, None, 0, 1), op(4, None, 3, 2)])
        .unwrap();
    let actual = root_log_likelihoods(&mut auto, &model, &[3, 4], 2);
    crate::assert_float_relative_slice_eq(&actual, &expected, 1e-12);
}

#[test]
fn exact_zero_gives_negative_infinity() {
    let model = jc69().unwrap();
    let mut core = ReferenceCore::new(&request(2, 4, 1, 1)).unwrap();
    core.set_tip_states(0, &[0]).unwrap();
    core.set_tip_partials(1, &[0.0; 4]).unwrap();
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    core.update_transition_matrices(0, &[0, 1], &[0.1, 0.1]).unwrap();
    core.update_partials(&[op(2, None, 0, 1)]).unwrap();
    let mut out = vec![0.0];
    core.calculate_root_log_likelihoods(2, &[1.0], &[0.25; 4], &[], &mut out)
        .unwrap();
    assert_eq!(out[0], f64::NEG_INFINITY);
    assert_eq!(core.sum_site_log_likelihoods(&out), f64::NEG_INFINITY);
}

#[test]
fn category_rates_store_restore() {
    let model = jc69().unwrap();
    let mut core = ReferenceCore::new(&request(2, 4, 1, 2)).unwrap();
    core.set_eigen_decomposition(0, model.eigen()).unwrap();
    core.set_category_rates(&[0.5, 1.5]).unwrap();
    core.store_state();
    core.set_category_rates(&[1.0, 1.0]).unwrap();
    core.restore_state();
    core.update_transition_matrices(0, &[0], &[0.2]).unwrap();
    let mut matrix = vec![0.0; 32];
    core.get_transition_matrix(0, &mut matrix).unwrap();
    assert_relative_eq!(matrix[0], model.p(0.1)[(0, 0)], epsilon = 1e-12);
    assert_relative_eq!(matrix[16], model.p(0.3)[(0, 0)], epsilon = 1e-12);
}

#[test]
fn invalid_core_inputs() {
    let mut core = ReferenceCore::new(&request(2, 4, 2, 1)).unwrap();
    assert_matches!(
        core.set_tip_states(0, &[0]).unwrap_err().downcast_ref::<CoreError>(),
        Some(CoreError::Dimension { .. })
    );
    assert_matches!(
        core.set_tip_states(0, &[0, 5])
            .unwrap_err()
            .downcast_ref::<CoreError>(),
        Some(CoreError::InvalidState { tip: 0, state: 5 })
    );
    assert_matches!(
        core.set_tip_states(2, &[0, 1])
            .unwrap_err()
            .downcast_ref::<CoreError>(),
        Some(CoreError::IndexOutOfRange { .. })
    );
    assert!(core.set_tip_partials(0, &[1.0; 4]).is_err());
    assert!(core.set_pattern_weights(&[1.0]).is_err());
    assert!(core.set_category_rates(&[1.0, 1.0]).is_err());
    assert!(core.set_eigen_decomposition(0, SubstModel::binary_symmetric().eigen()).is_err());
    assert!(core.update_partials(&[op(1, None, 0, 2)]).is_err());
    assert!(core.update_partials(&[op(2, None, 2, 0)]).is_err());
    // no tip data was set
    assert!(core.update_partials(&[op(2, None, 0, 1)]).is_err());
}

#[rstest]
#[case::one_state(request(2, 1, 1, 1))]
#[case::no_patterns(request(2, 4, 0, 1))]
#[case::no_categories(request(2, 4, 1, 0))]
fn invalid_requests(#[case] req: BackendRequest) {
    assert!(ReferenceCore::new(&req).is_err());
}

fn counting_loader(
    counter: Arc<AtomicUsize>,
    accept: bool,
) -> crate::backends::factory::Loader {
    Box::new(move |req: &BackendRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        if accept {
            ReferenceCore::new(req)
                .ok()
                .map(|core| Box::new(core) as Box<dyn LikelihoodCore>)
        } else {
            None
        }
    })
}

#[test]
fn registry_prefers_gpu_then_falls_back() {
    let gpu_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry.register(
        BackendKind::Gpu,
        "fake-gpu",
        BackendFlags::PROCESSOR_GPU | BackendFlags::SCALING_MANUAL,
        counting_loader(gpu_calls.clone(), false),
    );
    assert_eq!(
        registry.probe_order(&[]),
        vec!["fake-gpu", "reference-cpu"]
    );
    let core = registry.create(&request(2, 4, 1, 1), &[]).unwrap();
    assert_eq!(gpu_calls.load(Ordering::SeqCst), 1);
    assert_eq!(core.details().kind, BackendKind::Reference);
}

#[test]
fn registry_first_success_wins() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry
        .register(
            BackendKind::Native,
            "native-a",
            BackendFlags::PROCESSOR_CPU,
            counting_loader(first.clone(), true),
        )
        .register(
            BackendKind::Native,
            "native-b",
            BackendFlags::PROCESSOR_CPU,
            counting_loader(second.clone(), true),
        );
    registry.create(&request(2, 4, 1, 1), &[]).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[test]
fn registry_skips_loaders_without_required_flags() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry.register(
        BackendKind::Native,
        "plain",
        BackendFlags::PROCESSOR_CPU,
        counting_loader(calls.clone(), true),
    );
    let mut req = request(2, 4, 1, 1);
    req.required_flags = BackendFlags::SCALING_AUTO;
    let core = registry.create(&req, &[]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(core.details().kind, BackendKind::Reference);
    assert!(core.details().flags.contains(BackendFlags::SCALING_AUTO));
}

#[test]
fn registry_resource_order_override() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry.register(
        BackendKind::Gpu,
        "fake-gpu",
        BackendFlags::PROCESSOR_GPU,
        counting_loader(calls.clone(), true),
    );
    let core = registry
        .create(&request(2, 4, 1, 1), &[BackendKind::Reference, BackendKind::Gpu])
        .unwrap();
    assert_eq!(core.details().kind, BackendKind::Reference);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        registry.probe_order(&[BackendKind::Gpu]),
        vec!["fake-gpu"]
    );
}

#[test]
fn registry_reference_is_last_resort() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry.register(
        BackendKind::Gpu,
        "fake-gpu",
        BackendFlags::PROCESSOR_GPU,
        counting_loader(calls.clone(), false),
    );
    let core = registry
        .create(&request(2, 4, 1, 1), &[BackendKind::Gpu])
        .unwrap();
    assert_eq!(core.details().kind, BackendKind::Reference);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.create(&request(2, 1, 1, 1), &[]).is_err());
}

#[cfg(feature = "parallel")]
mod threaded {
    use super::*;
    use crate::backends::threaded::dependency_levels;
    use crate::backends::ThreadedCore;

    #[test]
    fn levels_follow_dependencies() {
        // ((0,1)5,(2,3)6)7 with 4 hanging off the root: ((0,1),(2,3)) + 4
        let ops = [
            op(5, None, 0, 1),
            op(6, None, 2, 3),
            op(7, None, 5, 6),
            op(8, None, 7, 4),
        ];
        assert_eq!(dependency_levels(&ops), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn threaded_matches_reference() {
        let model = hky(&[0.1, 0.2, 0.3, 0.4], 3.0).unwrap();
        let mut req = request(5, 4, 3, 2);
        req.threads = 3;
        let mut reference = ReferenceCore::new(&req).unwrap();
        let mut threaded = ThreadedCore::new(&req).unwrap();
        assert_eq!(threaded.details().kind, BackendKind::Native);
        let states: [&[usize]; 5] = [&[0, 1, 2], &[3, 1, 4], &[0, 0, 2], &[1, 2, 3], &[2, 2, 2]];
        let times = [0.1, 0.2, 0.3, 0.4, 0.5, 0.15, 0.25, 0.05];
        let ops = [
            op(5, Some(Rescale::Write(5)), 0, 1),
            op(6, Some(Rescale::Write(6)), 2, 3),
            op(7, Some(Rescale::Write(7)), 5, 6),
            op(8, Some(Rescale::Write(8)), 7, 4),
        ];
        let mut results = Vec::new();
        let cores: [&mut dyn LikelihoodCore; 2] = [&mut reference, &mut threaded];
        for core in cores {
            for (tip, tip_states) in states.iter().enumerate() {
                core.set_tip_states(tip, tip_states).unwrap();
            }
            core.set_eigen_decomposition(0, model.eigen()).unwrap();
            core.set_category_rates(&[0.5, 1.5]).unwrap();
            core.update_transition_matrices(0, &[0, 1, 2, 3, 4, 5, 6, 7], &times)
                .unwrap();
            core.update_partials(&ops).unwrap();
            let mut out = vec![0.0; 3];
            core.calculate_root_log_likelihoods(
                8,
                &[0.5, 0.5],
                model.freqs().as_slice(),
                &[5, 6, 7, 8],
                &mut out,
            )
            .unwrap();
            results.push(out);
        }
        crate::assert_float_relative_slice_eq(&results[0], &results[1], 1e-12);
    }
}

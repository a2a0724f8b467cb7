//! End-to-end scenarios driven through the distributed simulator.

use axon_runtime::{Key, OpSpec, SignalSpec, Tensor};
use axon_sim::{SimConfig, SimError, Simulator};

fn values(sim: &Simulator, probe_key: u64) -> Vec<Vec<f64>> {
    sim.probe_data(Key(probe_key))
        .unwrap()
        .iter()
        .map(|t| t.data().to_vec())
        .collect()
}

#[test]
fn test_scalar_reset_and_probe() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "Reset;0;1;3.5").unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    sim.finalize_build().unwrap();
    sim.run_n_steps(2).unwrap();

    assert_eq!(values(&sim, 100), vec![vec![3.5], vec![3.5]]);
    sim.close();
}

#[test]
fn test_dot_product() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "A", Tensor::from_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]))
        .unwrap();
    sim.add_signal(0, Key(2), "X", Tensor::vector(&[1.0, 1.0])).unwrap();
    sim.add_signal(0, Key(3), "Y", Tensor::vector(&[0.0, 0.0])).unwrap();
    sim.add_op(0, "Reset;0;3;0").unwrap();
    sim.add_op(0, "DotInc;1;1;2;3").unwrap();
    sim.add_probe(0, Key(100), "3", 1).unwrap();
    sim.finalize_build().unwrap();
    sim.run_n_steps(1).unwrap();

    assert_eq!(values(&sim, 100), vec![vec![3.0, 7.0]]);
    sim.close();
}

/// Build a two-chunk ring: each rank resets its own `x` and ships it to the
/// peer's `y` with one-step latency.
fn build_ring(merged: bool) -> Simulator {
    let mut sim = Simulator::with_config(
        2,
        SimConfig {
            merged,
            ..SimConfig::default()
        },
    );
    // Rank 0: x = key 10, y = key 11.
    sim.add_signal(0, Key(10), "x0", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(0, Key(11), "y0", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "MPIRecv;0.5;1;8;11").unwrap();
    sim.add_op(0, "Reset;1;10;1").unwrap();
    sim.add_op(0, "MPISend;2;1;7;10").unwrap();
    sim.add_probe(0, Key(100), "11", 1).unwrap();
    // Rank 1: x = key 20, y = key 21.
    sim.add_signal(1, Key(20), "x1", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(1, Key(21), "y1", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(1, "MPIRecv;0.5;0;7;21").unwrap();
    sim.add_op(1, "Reset;1;20;2").unwrap();
    sim.add_op(1, "MPISend;2;0;8;20").unwrap();
    sim.add_probe(1, Key(101), "21", 1).unwrap();
    sim.finalize_build().unwrap();
    sim
}

#[test]
fn test_two_chunk_ring_one_step_delay() {
    let mut sim = build_ring(false);
    sim.run_n_steps(3).unwrap();

    // First sample is the initial zero; later samples carry the peer's
    // previous-step value.
    assert_eq!(values(&sim, 100), vec![vec![0.0], vec![2.0], vec![2.0]]);
    assert_eq!(values(&sim, 101), vec![vec![0.0], vec![1.0], vec![1.0]]);
    sim.close();
}

#[test]
fn test_merged_ring_matches_unmerged() {
    let mut plain = build_ring(false);
    let mut merged = build_ring(true);
    plain.run_n_steps(5).unwrap();
    merged.run_n_steps(5).unwrap();

    assert_eq!(values(&plain, 100), values(&merged, 100));
    assert_eq!(values(&plain, 101), values(&merged, 101));
    plain.close();
    merged.close();
}

/// A spiking network split across two ranks: rank 0 runs the LIF population,
/// rank 1 filters the shipped spike train.
fn build_spiking_pair() -> Simulator {
    let mut sim = Simulator::new(2, 0.001);
    sim.add_signal(0, Key(10), "J", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(0, Key(11), "spikes", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "Reset;0;10;2.0").unwrap();
    sim.add_op(0, "SimLIF;1;1;0.02;0.002;0.001;10;11").unwrap();
    sim.add_op(0, "MPISend;2;1;1;11").unwrap();
    sim.add_probe(0, Key(100), "11", 1).unwrap();

    sim.add_signal(1, Key(20), "spikes_in", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(1, Key(21), "filtered", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(1, "MPIRecv;0.5;0;1;20").unwrap();
    sim.add_op(1, "Filter;1;20;21;0.04877;-0.95123").unwrap();
    sim.add_probe(1, Key(101), "21", 1).unwrap();
    sim.finalize_build().unwrap();
    sim
}

#[test]
fn test_lif_fires_and_determinism_across_simulators() {
    let mut a = build_spiking_pair();
    let mut b = build_spiking_pair();
    a.run_n_steps(50).unwrap();
    b.run_n_steps(50).unwrap();

    let spikes = values(&a, 100);
    let dt = 0.001;
    assert!(spikes.iter().any(|s| s[0] == 1.0 / dt));
    assert!(spikes.iter().all(|s| s[0] == 0.0 || s[0] == 1.0 / dt));

    assert_eq!(spikes, values(&b, 100));
    assert_eq!(values(&a, 101), values(&b, 101));
    a.close();
    b.close();
}

#[test]
fn test_reset_idempotence() {
    let mut sim = build_spiking_pair();
    sim.reset(3).unwrap();
    sim.run_n_steps(40).unwrap();
    let first = (values(&sim, 100), values(&sim, 101));

    sim.reset(3).unwrap();
    sim.run_n_steps(40).unwrap();
    let second = (values(&sim, 100), values(&sim, 101));

    assert_eq!(first, second);
    sim.close();
}

#[test]
fn test_reset_restores_initial_values() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[9.0])).unwrap();
    sim.add_signal(0, Key(2), "b", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "Reset;0;1;5").unwrap();
    sim.add_op(0, "Copy;1;2;1").unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    sim.add_probe(0, Key(101), "2", 1).unwrap();
    sim.finalize_build().unwrap();

    sim.run_n_steps(1).unwrap();
    assert_eq!(values(&sim, 100), vec![vec![5.0]]);
    assert_eq!(values(&sim, 101), vec![vec![5.0]]);

    sim.reset(0).unwrap();
    assert!(values(&sim, 100).is_empty());

    // One fresh step reproduces the first run's data.
    sim.run_n_steps(1).unwrap();
    assert_eq!(values(&sim, 101), vec![vec![5.0]]);
    sim.close();
}

#[test]
fn test_run_zero_steps_is_noop() {
    let mut sim = build_ring(false);
    sim.run_n_steps(0).unwrap();
    assert!(values(&sim, 100).is_empty());
    assert!(values(&sim, 101).is_empty());
    sim.close();
}

#[test]
fn test_probe_period_sample_count() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "Reset;0;1;1").unwrap();
    sim.add_probe(0, Key(100), "1", 3).unwrap();
    sim.finalize_build().unwrap();
    sim.run_n_steps(10).unwrap();

    // ceil(10 / 3) samples.
    assert_eq!(values(&sim, 100).len(), 4);
    sim.close();
}

#[test]
fn test_missing_peer_fails_finalize() {
    let mut sim = Simulator::new(2, 0.001);
    sim.add_signal(0, Key(1), "x", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "MPISend;1;1;7;1").unwrap();
    let err = sim.finalize_build();
    assert!(matches!(
        err,
        Err(SimError::Build(
            axon_runtime::BuildError::MissingPeer { src: 0, dst: 1, tag: 7 }
        ))
    ));
    sim.close();
}

#[test]
fn test_comm_size_mismatch_fails_finalize() {
    let mut sim = Simulator::new(2, 0.001);
    sim.add_signal(0, Key(1), "x", Tensor::vector(&[0.0, 0.0])).unwrap();
    sim.add_signal(1, Key(2), "y", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "MPISend;1;1;7;1").unwrap();
    sim.add_op(1, "MPIRecv;0.5;0;7;2").unwrap();
    let err = sim.finalize_build();
    assert!(matches!(
        err,
        Err(SimError::Build(
            axon_runtime::BuildError::CommSizeMismatch { send_len: 2, recv_len: 1, .. }
        ))
    ));
    sim.close();
}

#[test]
fn test_unknown_op_kind_rejected_at_add() {
    let mut sim = Simulator::new(2, 0.001);
    let err = sim.add_op(1, "Convolve;1;2;3");
    assert!(matches!(
        err,
        Err(SimError::Build(axon_runtime::BuildError::UnknownOpKind(_)))
    ));
    sim.close();
}

#[test]
fn test_worker_build_error_surfaces_at_finalize() {
    let mut sim = Simulator::new(2, 0.001);
    sim.add_signal(1, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(1, Key(1), "dup", Tensor::vector(&[0.0])).unwrap();
    let err = sim.finalize_build();
    assert!(matches!(err, Err(SimError::Worker { rank: 1, .. })));
    sim.close();
}

#[test]
fn test_host_callback_via_simulator() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "out", Tensor::vector(&[0.0])).unwrap();
    sim.add_host_callback(
        OpSpec::HostCallback {
            index: 0.0,
            output: SignalSpec::full(Key(1)),
            want_time: true,
            input: None,
        },
        Box::new(|time, _| vec![time.unwrap() * 1000.0]),
    )
    .unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    sim.finalize_build().unwrap();
    sim.run_n_steps(3).unwrap();

    assert_eq!(values(&sim, 100), vec![vec![0.0], vec![1.0], vec![2.0]]);
    sim.close();
}

#[test]
fn test_log_sink_writes_per_rank_manifests() {
    let dir = std::env::temp_dir().join("axon_test_sim_log");
    let _ = std::fs::remove_dir_all(&dir);

    let mut sim = build_ring(false);
    sim.run_n_steps_logged(4, Some(&dir)).unwrap();

    // Data went to the sinks, not the in-memory gather.
    assert!(values(&sim, 100).is_empty());
    assert!(values(&sim, 101).is_empty());
    sim.close();

    for rank in 0..2 {
        let manifest = dir.join(format!("rank{rank}")).join("manifest.json");
        assert!(manifest.exists(), "missing {}", manifest.display());
        let raw = std::fs::read_to_string(&manifest).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["dt"], 0.001);
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_unwritable_log_path_is_nonfatal() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_op(0, "Reset;0;1;2").unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    sim.finalize_build().unwrap();

    // The sink cannot be created; the run must still complete, gathering
    // probe data in memory instead.
    sim.run_n_steps_logged(2, Some(std::path::Path::new("/proc/axon-no-such-place")))
        .unwrap();
    assert_eq!(values(&sim, 100), vec![vec![2.0], vec![2.0]]);
    sim.close();
}

#[test]
fn test_probe_keys_in_registration_order() {
    let mut sim = Simulator::new(2, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_signal(1, Key(2), "b", Tensor::vector(&[0.0])).unwrap();
    sim.add_probe(1, Key(200), "2", 1).unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    assert_eq!(sim.probe_keys(), vec![Key(200), Key(100)]);
    sim.close();
}

#[test]
fn test_duplicate_probe_key_rejected() {
    let mut sim = Simulator::new(1, 0.001);
    sim.add_signal(0, Key(1), "a", Tensor::vector(&[0.0])).unwrap();
    sim.add_probe(0, Key(100), "1", 1).unwrap();
    let err = sim.add_probe(0, Key(100), "1", 1);
    assert!(matches!(
        err,
        Err(SimError::Build(axon_runtime::BuildError::DuplicateProbe(Key(100))))
    ));
    sim.close();
}

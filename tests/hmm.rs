//!
//! Cross-module properties of the DP, the gradients and the trainers
//!
#[macro_use]
extern crate approx;

use hohmm::diff::{score_and_gradient, DiffTables};
use hohmm::dp::ScoreKind;
use hohmm::mocks::*;
use hohmm::seq::{Alphabet, Dataset, Sequence};
use hohmm::train::{train_em, EmConfig, EmKind, GibbsConfig, SampledHmm};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use test_case::test_case;

///
/// The total probability recomputed at every forward/backward cut must
/// agree across all layers, including models with silent states.
///
#[test]
fn forward_backward_cuts_agree() {
    let a = Alphabet::binary();
    let seq = Sequence::encode(b"0010010", &a).unwrap();
    for model in [mock_casino(), mock_silent_bridge(), mock_order2()] {
        let cuts = model.log_prob_cuts(&seq).unwrap();
        assert_eq!(cuts.len(), seq.len() + 1);
        for cut in cuts.iter() {
            assert_relative_eq!(*cut, cuts[0], epsilon = 1e-9);
        }
        assert_relative_eq!(
            cuts[0],
            model.log_prob(&seq).unwrap().to_log_value(),
            epsilon = 1e-9
        );
    }
}

///
/// The best path scores below the full sum, and rescoring the decoded
/// path reproduces the Viterbi score exactly.
///
#[test]
fn viterbi_path_and_score_agree() {
    let a = Alphabet::dna();
    let model = mock_cpg();
    let seq = Sequence::encode(b"ACGCGTATCG", &a).unwrap();
    let (path, score) = model.viterbi(&seq).unwrap();
    let full = model.log_prob(&seq).unwrap();
    assert!(score <= full);
    let rescored = model.log_prob_for_path(&path, &seq).unwrap();
    assert_relative_eq!(
        rescored.to_log_value(),
        score.to_log_value(),
        epsilon = 1e-9
    );
}

/// A silent shortcut with the same marginal move probabilities must not
/// change any sequence score.
#[test]
fn silent_bridge_matches_collapsed_model() {
    let a = Alphabet::binary();
    let bridged = mock_silent_bridge();
    let collapsed = mock_silent_bridge_collapsed();
    for text in [&b"00"[..], b"0110", b"010010", b"11011011"] {
        let seq = Sequence::encode(text, &a).unwrap();
        assert_relative_eq!(
            bridged.log_prob(&seq).unwrap().to_log_value(),
            collapsed.log_prob(&seq).unwrap().to_log_value(),
            epsilon = 1e-9
        );
    }
}

/// Scoring is pure: repeated calls are bit-identical.
#[test]
fn scoring_is_deterministic() {
    let model = mock_order2();
    let data = mock_binary_dataset();
    for seq in data.iter() {
        let a = model.log_prob(seq).unwrap().to_log_value();
        let b = model.log_prob(seq).unwrap().to_log_value();
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

///
/// Analytic gradients against central finite differences at a random
/// parameter point, for both score kinds.
///
#[test_case(ScoreKind::Likelihood; "likelihood")]
#[test_case(ScoreKind::Viterbi; "viterbi")]
fn gradient_matches_finite_differences(kind: ScoreKind) {
    let mut model = mock_cpg_prior(0.5);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
    model.initialize_randomly(&mut rng).unwrap();
    let a = Alphabet::dna();
    let seq = Sequence::encode(b"ACGCGTAT", &a).unwrap();

    let mut tables = DiffTables::new(&model);
    let mut grad = vec![0.0; model.n_parameters()];
    score_and_gradient(&model, &mut tables, &seq, kind, 1.0, Some(&mut grad)).unwrap();

    let params = model.parameters_as_vec();
    let h = 1e-4;
    let mut probe = model.clone();
    for p in 0..params.len() {
        let mut plus = params.clone();
        plus[p] += h;
        probe.set_parameters_from_slice(&plus);
        let up = score_and_gradient(&probe, &mut tables, &seq, kind, 1.0, None).unwrap();
        let mut minus = params.clone();
        minus[p] -= h;
        probe.set_parameters_from_slice(&minus);
        let down = score_and_gradient(&probe, &mut tables, &seq, kind, 1.0, None).unwrap();
        assert_abs_diff_eq!(grad[p], (up - down) / (2.0 * h), epsilon = 1e-5);
    }
}

///
/// The joint objective never decreases over EM iterations, and the
/// parallel coordinator reproduces the sequential run exactly.
///
#[test_case(1; "sequential")]
#[test_case(4; "four workers")]
fn em_is_monotone_and_thread_count_invariant(n_threads: usize) {
    let data = mock_dna_dataset();
    let mut config = EmConfig::new(EmKind::BaumWelch);
    config.max_iterations = 6;
    config.threshold = 0.0;

    let mut reference = mock_cpg_prior(0.5);
    let res_ref = train_em(&mut reference, &data, &config).unwrap();
    for pair in res_ref.history.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-9);
    }

    let mut model = mock_cpg_prior(0.5);
    config.n_threads = n_threads;
    let res = train_em(&mut model, &data, &config).unwrap();
    assert_eq!(res.history.len(), res_ref.history.len());
    for (a, b) in res.history.iter().zip(res_ref.history.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-9);
    }
    for (a, b) in model
        .parameters_as_vec()
        .iter()
        .zip(reference.parameters_as_vec().iter())
    {
        assert_relative_eq!(a, b, epsilon = 1e-9);
    }
}

///
/// Gibbs sampling end to end: train, query, persist, reload, and get the
/// same marginal answers back.
///
#[test]
fn gibbs_samples_survive_a_round_trip() {
    let model = mock_casino_prior(1.0);
    let data = mock_binary_dataset();
    let config = GibbsConfig {
        n_chains: 2,
        n_samples: 6,
        max_burn_in: 25,
        seed: 5,
    };
    let sampled = SampledHmm::train(&model, &data, &config).unwrap();
    assert_eq!(sampled.n_samples(), 12);

    let seq = data.get(0);
    let lp = sampled.log_prob(seq).unwrap().to_log_value();
    assert!(lp.is_finite() && lp < 0.0);
    let (path, _) = sampled.viterbi(seq).unwrap();
    assert_eq!(path.len(), seq.len());

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("sampled.json");
    sampled.save(&file).unwrap();
    let loaded = SampledHmm::load(&file).unwrap();
    assert_eq!(loaded.n_samples(), sampled.n_samples());
    assert_eq!(loaded.log_prob(seq).unwrap().to_log_value(), lp);
}

/// The model itself round-trips through JSON without changing scores.
#[test]
fn model_round_trips_through_json() {
    let model = mock_order2();
    let text = serde_json::to_string(&model).unwrap();
    let loaded: hohmm::hmm::HigherOrderHmm = serde_json::from_str(&text).unwrap();
    let data = mock_binary_dataset();
    for seq in data.iter() {
        assert_eq!(
            loaded.log_prob(seq).unwrap().to_log_value(),
            model.log_prob(seq).unwrap().to_log_value()
        );
    }
}

/// Uniform weights scale the EM objective but leave the estimates alone.
#[test]
fn weights_scale_the_em_objective() {
    let a = Alphabet::binary();
    let seqs = vec![
        Sequence::encode(b"0010010", &a).unwrap(),
        Sequence::encode(b"110110", &a).unwrap(),
    ];
    let doubled = Dataset::with_weights(seqs.clone(), vec![2.0, 2.0]).unwrap();
    let plain = Dataset::from_seqs(seqs);

    let mut config = EmConfig::new(EmKind::BaumWelch);
    config.max_iterations = 4;
    config.threshold = 0.0;
    let mut m1 = mock_casino();
    let r1 = train_em(&mut m1, &plain, &config).unwrap();
    let mut m2 = mock_casino();
    let r2 = train_em(&mut m2, &doubled, &config).unwrap();
    for (a, b) in r1.history.iter().zip(r2.history.iter()) {
        assert_relative_eq!(2.0 * a, b, epsilon = 1e-9);
    }
    for (a, b) in m1
        .parameters_as_vec()
        .iter()
        .zip(m2.parameters_as_vec().iter())
    {
        assert_relative_eq!(a, b, epsilon = 1e-9);
    }
}

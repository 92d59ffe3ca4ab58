//!
//! Mock models and data sets for testing
//!
use crate::hmm::emission::DiscreteEmission;
use crate::hmm::{Emission, HigherOrderHmm, State, TransitionElement};
use crate::seq::{Alphabet, Dataset, Sequence};

/// Element with the given child probabilities and no prior.
fn element(context: &[usize], children: &[usize], probs: &[f64]) -> TransitionElement {
    let mut e = TransitionElement::new(context, children, &[]).unwrap();
    for (i, &p) in probs.iter().enumerate() {
        e.add_to_statistic(i, p);
    }
    e.estimate_from_statistic();
    e.reset_statistic();
    e
}

/// Element with uniform probabilities and `ess` pseudo counts spread evenly.
fn element_prior(context: &[usize], children: &[usize], ess: f64) -> TransitionElement {
    let hyper = vec![ess / children.len() as f64; children.len()];
    TransitionElement::new(context, children, &hyper).unwrap()
}

///
/// Order-zero two-state model over `{0, 1}`
///
/// ```text
/// state   weight   P(0)   P(1)
/// F       0.6      0.5    0.5
/// L       0.4      0.9    0.1
/// ```
///
/// Position scores factorize, so totals are easy to compute by hand:
/// `P(x) = prod_l (0.6 * P_F(x_l) + 0.4 * P_L(x_l))`.
///
pub fn mock_casino() -> HigherOrderHmm {
    let states = vec![State::new("F", 0), State::new("L", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::from_probs(&[0.5, 0.5])),
        Emission::Discrete(DiscreteEmission::from_probs(&[0.9, 0.1])),
    ];
    let elements = vec![element(&[], &[0, 1], &[0.6, 0.4])];
    HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements).unwrap()
}

///
/// `mock_casino` structure with uniform distributions and `ess` pseudo
/// counts on every distribution, for training from a random start.
///
pub fn mock_casino_prior(ess: f64) -> HigherOrderHmm {
    let states = vec![State::new("F", 0), State::new("L", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::new(2, ess)),
        Emission::Discrete(DiscreteEmission::new(2, ess)),
    ];
    let elements = vec![element_prior(&[], &[0, 1], ess)];
    HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements).unwrap()
}

///
/// Order-one two-state DNA model
///
/// ```text
/// bg   emits A,C,G,T with 0.3, 0.2, 0.2, 0.3
/// cpg  emits A,C,G,T with 0.1, 0.4, 0.4, 0.1
///
/// start -> bg 0.7, cpg 0.3
/// bg    -> bg 0.85, cpg 0.15
/// cpg   -> bg 0.25, cpg 0.75
/// ```
///
pub fn mock_cpg() -> HigherOrderHmm {
    let states = vec![State::new("bg", 0), State::new("cpg", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::from_probs(&[0.3, 0.2, 0.2, 0.3])),
        Emission::Discrete(DiscreteEmission::from_probs(&[0.1, 0.4, 0.4, 0.1])),
    ];
    let elements = vec![
        element(&[], &[0, 1], &[0.7, 0.3]),
        element(&[0], &[0, 1], &[0.85, 0.15]),
        element(&[1], &[0, 1], &[0.25, 0.75]),
    ];
    HigherOrderHmm::new(Alphabet::dna(), states, emissions, elements).unwrap()
}

///
/// `mock_cpg` structure with uniform distributions and `ess` pseudo counts
/// on every distribution.
///
pub fn mock_cpg_prior(ess: f64) -> HigherOrderHmm {
    let states = vec![State::new("bg", 0), State::new("cpg", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::new(4, ess)),
        Emission::Discrete(DiscreteEmission::new(4, ess)),
    ];
    let elements = vec![
        element_prior(&[], &[0, 1], ess),
        element_prior(&[0], &[0, 1], ess),
        element_prior(&[1], &[0, 1], ess),
    ];
    HigherOrderHmm::new(Alphabet::dna(), states, emissions, elements).unwrap()
}

///
/// Order-one model with a silent bridge
///
/// ```text
/// X emits 0,1 with 0.6, 0.4     S silent     Y emits 0,1 with 0.2, 0.8
///
/// start -> X 1.0
/// X     -> X 0.5, S 0.3, Y 0.2
/// S     -> Y 1.0
/// Y     absorbs
/// ```
///
/// Any path ends in `Y`, reached either directly or through the silent
/// bridge, so the model is equivalent to `mock_silent_bridge_collapsed`.
///
pub fn mock_silent_bridge() -> HigherOrderHmm {
    let states = vec![State::new("X", 0), State::new("S", 1), State::new("Y", 2)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::from_probs(&[0.6, 0.4])),
        Emission::Silent,
        Emission::Discrete(DiscreteEmission::from_probs(&[0.2, 0.8])),
    ];
    let elements = vec![
        element(&[], &[0], &[1.0]),
        element(&[0], &[0, 1, 2], &[0.5, 0.3, 0.2]),
        element(&[1], &[2], &[1.0]),
    ];
    HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements).unwrap()
}

///
/// `mock_silent_bridge` with the bridge probability folded into the direct
/// move: `X -> X 0.5, Y 0.5`.
///
pub fn mock_silent_bridge_collapsed() -> HigherOrderHmm {
    let states = vec![State::new("X", 0), State::new("Y", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::from_probs(&[0.6, 0.4])),
        Emission::Discrete(DiscreteEmission::from_probs(&[0.2, 0.8])),
    ];
    let elements = vec![
        element(&[], &[0], &[1.0]),
        element(&[0], &[0, 1], &[0.5, 0.5]),
    ];
    HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements).unwrap()
}

///
/// Order-two two-state model over `{0, 1}` with a full context tree.
///
pub fn mock_order2() -> HigherOrderHmm {
    let states = vec![State::new("u", 0), State::new("v", 1)];
    let emissions = vec![
        Emission::Discrete(DiscreteEmission::from_probs(&[0.8, 0.2])),
        Emission::Discrete(DiscreteEmission::from_probs(&[0.25, 0.75])),
    ];
    let elements = vec![
        element(&[], &[0, 1], &[0.5, 0.5]),
        element(&[0], &[0, 1], &[0.7, 0.3]),
        element(&[1], &[0, 1], &[0.4, 0.6]),
        element(&[0, 0], &[0, 1], &[0.8, 0.2]),
        element(&[0, 1], &[0, 1], &[0.3, 0.7]),
        element(&[1, 0], &[0, 1], &[0.6, 0.4]),
        element(&[1, 1], &[0, 1], &[0.1, 0.9]),
    ];
    HigherOrderHmm::new(Alphabet::binary(), states, emissions, elements).unwrap()
}

///
/// Small binary data set for training tests.
///
pub fn mock_binary_dataset() -> Dataset {
    let a = Alphabet::binary();
    let seqs = [
        "00100010",
        "0110010",
        "000010",
        "10010001",
        "0001100",
        "010000",
    ];
    Dataset::from_seqs(
        seqs.iter()
            .map(|s| Sequence::encode(s.as_bytes(), &a).unwrap())
            .collect(),
    )
}

///
/// Small DNA data set for training tests.
///
pub fn mock_dna_dataset() -> Dataset {
    let a = Alphabet::dna();
    let seqs = [
        "ACGCGTTA",
        "AATAATCG",
        "CGCGCGAT",
        "ATTATACG",
        "GCGCATTA",
        "TTACGCGC",
    ];
    Dataset::from_seqs(
        seqs.iter()
            .map(|s| Sequence::encode(s.as_bytes(), &a).unwrap())
            .collect(),
    )
}

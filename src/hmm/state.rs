//!
//! HMM state: a named node referencing an emission
//!
use serde::{Deserialize, Serialize};

///
/// A state of the HMM.
///
/// Multiple states can share one emission (common for strand-symmetric
/// models). `forward == false` means the state reads the sequence on the
/// reverse strand, so the emission sees the complement rank
/// `alphabet_size - 1 - rank`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Display name used in path output and dot export
    pub name: String,
    /// Index into the model's emission list
    pub emission_idx: usize,
    /// Strand of the state
    pub forward: bool,
}

impl State {
    pub fn new(name: &str, emission_idx: usize) -> State {
        State {
            name: name.to_string(),
            emission_idx,
            forward: true,
        }
    }
    pub fn new_reverse(name: &str, emission_idx: usize) -> State {
        State {
            name: name.to_string(),
            emission_idx,
            forward: false,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

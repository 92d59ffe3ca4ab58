//!
//! Discrete alphabets, encoded sequences and weighted data sets
//!
use crate::error::{HmmError, Result};
use serde::{Deserialize, Serialize};

///
/// Finite symbol alphabet
///
/// Symbols are raw bytes; sequences are stored as ranks `0..size`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alphabet {
    symbols: Vec<u8>,
}

impl Alphabet {
    ///
    /// Construct from a symbol table. Duplicate symbols are rejected.
    ///
    pub fn new(symbols: &[u8]) -> Result<Alphabet> {
        if symbols.is_empty() {
            return Err(HmmError::wrong_model("alphabet is empty"));
        }
        for (i, &s) in symbols.iter().enumerate() {
            if symbols[..i].contains(&s) {
                return Err(HmmError::wrong_model(format!(
                    "duplicate symbol '{}' in alphabet",
                    s as char
                )));
            }
        }
        Ok(Alphabet {
            symbols: symbols.to_vec(),
        })
    }
    ///
    /// `{A, C, G, T}`
    ///
    pub fn dna() -> Alphabet {
        Alphabet {
            symbols: vec![b'A', b'C', b'G', b'T'],
        }
    }
    ///
    /// `{0, 1}`
    ///
    pub fn binary() -> Alphabet {
        Alphabet {
            symbols: vec![b'0', b'1'],
        }
    }
    ///
    /// number of symbols
    ///
    pub fn size(&self) -> usize {
        self.symbols.len()
    }
    ///
    /// rank of a symbol, `None` if the symbol is not in the alphabet
    ///
    pub fn rank(&self, symbol: u8) -> Option<usize> {
        self.symbols.iter().position(|&s| s == symbol)
    }
    ///
    /// symbol with the given rank
    ///
    pub fn symbol(&self, rank: usize) -> u8 {
        self.symbols[rank]
    }
}

///
/// A sequence encoded as alphabet ranks
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    ranks: Vec<u8>,
    alphabet_size: usize,
}

impl Sequence {
    ///
    /// Encode raw text with an alphabet.
    ///
    /// An out-of-alphabet byte is a `WrongAlphabet` error.
    ///
    pub fn encode(text: &[u8], alphabet: &Alphabet) -> Result<Sequence> {
        let mut ranks = Vec::with_capacity(text.len());
        for (pos, &b) in text.iter().enumerate() {
            match alphabet.rank(b) {
                Some(r) => ranks.push(r as u8),
                None => {
                    return Err(HmmError::wrong_alphabet(format!(
                        "symbol '{}' at position {} is not in the alphabet",
                        b as char, pos
                    )))
                }
            }
        }
        Ok(Sequence {
            ranks,
            alphabet_size: alphabet.size(),
        })
    }
    ///
    /// Construct directly from ranks (used by tests and samplers)
    ///
    pub fn from_ranks(ranks: Vec<u8>, alphabet_size: usize) -> Sequence {
        assert!(ranks.iter().all(|&r| (r as usize) < alphabet_size));
        Sequence {
            ranks,
            alphabet_size,
        }
    }
    ///
    /// sequence length L
    ///
    pub fn len(&self) -> usize {
        self.ranks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
    ///
    /// rank at position `pos`
    ///
    #[inline]
    pub fn rank(&self, pos: usize) -> usize {
        self.ranks[pos] as usize
    }
    ///
    /// size of the alphabet this sequence was encoded with
    ///
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }
    ///
    /// decode back into text
    ///
    pub fn to_text(&self, alphabet: &Alphabet) -> Vec<u8> {
        self.ranks
            .iter()
            .map(|&r| alphabet.symbol(r as usize))
            .collect()
    }
}

///
/// A weighted collection of sequences
///
/// Weights default to 1. During training the data set is shared read-only
/// between workers.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    seqs: Vec<Sequence>,
    weights: Option<Vec<f64>>,
}

impl Dataset {
    /// Constructor with unit weights
    pub fn from_seqs(seqs: Vec<Sequence>) -> Dataset {
        Dataset {
            seqs,
            weights: None,
        }
    }
    /// Constructor with explicit per-sequence weights
    pub fn with_weights(seqs: Vec<Sequence>, weights: Vec<f64>) -> Result<Dataset> {
        if seqs.len() != weights.len() {
            return Err(HmmError::wrong_length(format!(
                "weights length {} does not match the number of sequences {}",
                weights.len(),
                seqs.len()
            )));
        }
        Ok(Dataset {
            seqs,
            weights: Some(weights),
        })
    }
    /// the number of sequences
    pub fn len(&self) -> usize {
        self.seqs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
    /// get an iterator over the sequences
    pub fn iter(&self) -> impl Iterator<Item = &Sequence> + '_ {
        self.seqs.iter()
    }
    pub fn get(&self, index: usize) -> &Sequence {
        &self.seqs[index]
    }
    /// weight of sequence `index` (1 when no weights were given)
    pub fn weight(&self, index: usize) -> f64 {
        match &self.weights {
            Some(w) => w[index],
            None => 1.0,
        }
    }
    /// sum of all weights
    pub fn total_weight(&self) -> f64 {
        match &self.weights {
            Some(w) => w.iter().sum(),
            None => self.seqs.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_ranks() {
        let a = Alphabet::dna();
        assert_eq!(a.size(), 4);
        assert_eq!(a.rank(b'A'), Some(0));
        assert_eq!(a.rank(b'T'), Some(3));
        assert_eq!(a.rank(b'N'), None);
        assert_eq!(a.symbol(2), b'G');
    }

    #[test]
    fn alphabet_duplicate() {
        let e = Alphabet::new(b"ACGA");
        assert!(matches!(e, Err(HmmError::WrongModel { .. })));
    }

    #[test]
    fn sequence_encode_decode() {
        let a = Alphabet::dna();
        let s = Sequence::encode(b"ATTCGATCGT", &a).unwrap();
        assert_eq!(s.len(), 10);
        assert_eq!(s.rank(0), 0);
        assert_eq!(s.rank(1), 3);
        assert_eq!(s.to_text(&a), b"ATTCGATCGT".to_vec());
    }

    #[test]
    fn sequence_encode_bad_symbol() {
        let a = Alphabet::binary();
        let e = Sequence::encode(b"0102", &a);
        assert!(matches!(e, Err(HmmError::WrongAlphabet { .. })));
    }

    #[test]
    fn dataset_weights() {
        let a = Alphabet::binary();
        let seqs = vec![
            Sequence::encode(b"01", &a).unwrap(),
            Sequence::encode(b"10", &a).unwrap(),
        ];
        let d = Dataset::from_seqs(seqs.clone());
        assert_eq!(d.len(), 2);
        assert_eq!(d.weight(0), 1.0);
        assert_eq!(d.total_weight(), 2.0);

        let d = Dataset::with_weights(seqs.clone(), vec![2.0, 0.5]).unwrap();
        assert_eq!(d.weight(0), 2.0);
        assert_eq!(d.total_weight(), 2.5);

        let e = Dataset::with_weights(seqs, vec![1.0]);
        assert!(e.is_err());
    }
}

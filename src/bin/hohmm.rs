use bio::io::fasta;
use clap::{ArgEnum, Parser, Subcommand};
use hohmm::error::{HmmError, Result};
use hohmm::hmm::HigherOrderHmm;
use hohmm::seq::{Dataset, Sequence};
use hohmm::train::{
    train_em, train_numerical, EmConfig, EmKind, GibbsConfig, NumericalConfig, SampledHmm,
};
use itertools::Itertools;
use log::info;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, about, version)]
struct Opts {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ArgEnum)]
enum Method {
    Em,
    Viterbi,
    Gradient,
    Gibbs,
}

#[derive(Clone, Copy, Debug, ArgEnum)]
enum Decoder {
    Viterbi,
    Posterior,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log-likelihood of every sequence under the model
    Score {
        /// Model JSON filename
        #[clap(short, long)]
        model: PathBuf,
        /// Input FASTA filename
        fasta: PathBuf,
        /// Score the sequences on all cores
        #[clap(long)]
        parallel: bool,
    },
    /// Most probable state path of every sequence
    Decode {
        /// Model JSON filename
        #[clap(short, long)]
        model: PathBuf,
        /// Input FASTA filename
        fasta: PathBuf,
        /// Single best path or position-wise posterior argmax
        #[clap(long, arg_enum, default_value = "viterbi")]
        decoder: Decoder,
    },
    /// Train the model and write the result as JSON
    Train {
        /// Model JSON filename
        #[clap(short, long)]
        model: PathBuf,
        /// Input FASTA filename
        fasta: PathBuf,
        /// Output filename, the trained model or the gibbs samples
        #[clap(short, long)]
        output: PathBuf,
        #[clap(long, arg_enum, default_value = "em")]
        method: Method,
        #[clap(long, default_value_t = 100)]
        iterations: usize,
        #[clap(long, default_value_t = 1)]
        threads: usize,
        /// Random restarts of the EM methods
        #[clap(long, default_value_t = 1)]
        starts: usize,
        #[clap(long, default_value_t = 0)]
        seed: u64,
        #[clap(long, default_value_t = 1e-6)]
        threshold: f64,
        /// Initial step of the gradient method
        #[clap(long, default_value_t = 0.1)]
        step_size: f64,
        /// Chains of the gibbs method
        #[clap(long, default_value_t = 3)]
        chains: usize,
        /// Parameter sets recorded per chain by the gibbs method
        #[clap(long, default_value_t = 100)]
        samples: usize,
    },
    /// Draw state paths from the path posterior
    Sample {
        /// Model JSON filename
        #[clap(short, long)]
        model: PathBuf,
        /// Input FASTA filename
        fasta: PathBuf,
        /// Paths per sequence
        #[clap(short, long, default_value_t = 1)]
        n: usize,
        #[clap(long, default_value_t = 0)]
        seed: u64,
    },
    /// Transition structure as graphviz dot
    Dot {
        /// Model JSON filename
        model: PathBuf,
    },
}

fn load_model(path: &Path) -> Result<HigherOrderHmm> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn save_model(model: &HigherOrderHmm, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), model)?;
    Ok(())
}

fn read_fasta(path: &Path, model: &HigherOrderHmm) -> Result<Vec<(String, Sequence)>> {
    let reader = fasta::Reader::from_file(path)
        .map_err(|e| HmmError::computation(format!("cannot open {}: {}", path.display(), e)))?;
    let mut seqs = Vec::new();
    for res in reader.records() {
        let record = res
            .map_err(|e| HmmError::computation(format!("cannot read {}: {}", path.display(), e)))?;
        let seq = Sequence::encode(record.seq(), model.alphabet())?;
        seqs.push((record.id().to_string(), seq));
    }
    info!("read {} sequences from {}", seqs.len(), path.display());
    Ok(seqs)
}

fn path_names(model: &HigherOrderHmm, path: &[usize]) -> String {
    path.iter().map(|&s| &model.state(s).name).join(",")
}

fn main() -> Result<()> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    println!("# started_at={}", chrono::Local::now());
    match &opts.command {
        Commands::Score {
            model,
            fasta,
            parallel,
        } => {
            let model = load_model(model)?;
            let seqs = read_fasta(fasta, &model)?;
            let scores: Vec<f64> = if *parallel {
                seqs.par_iter()
                    .map(|(_, seq)| Ok(model.log_prob(seq)?.to_log_value()))
                    .collect::<Result<_>>()?
            } else {
                seqs.iter()
                    .map(|(_, seq)| Ok(model.log_prob(seq)?.to_log_value()))
                    .collect::<Result<_>>()?
            };
            for ((id, _), score) in seqs.iter().zip(scores.iter()) {
                println!("{}\t{:.6}", id, score);
            }
        }
        Commands::Decode {
            model,
            fasta,
            decoder,
        } => {
            let model = load_model(model)?;
            for (id, seq) in read_fasta(fasta, &model)? {
                match decoder {
                    Decoder::Viterbi => {
                        let (path, score) = model.viterbi(&seq)?;
                        println!(
                            "{}\t{:.6}\t{}",
                            id,
                            score.to_log_value(),
                            path_names(&model, &path)
                        );
                    }
                    Decoder::Posterior => {
                        let path = model.posterior_decode(&seq)?;
                        println!("{}\t{}", id, path_names(&model, &path));
                    }
                }
            }
        }
        Commands::Train {
            model,
            fasta,
            output,
            method,
            iterations,
            threads,
            starts,
            seed,
            threshold,
            step_size,
            chains,
            samples,
        } => {
            let mut hmm = load_model(model)?;
            let seqs = read_fasta(fasta, &hmm)?;
            let data = Dataset::from_seqs(seqs.into_iter().map(|(_, s)| s).collect());
            match method {
                Method::Em | Method::Viterbi => {
                    let kind = match method {
                        Method::Em => EmKind::BaumWelch,
                        _ => EmKind::Viterbi,
                    };
                    let mut config = EmConfig::new(kind);
                    config.max_iterations = *iterations;
                    config.n_threads = *threads;
                    config.n_starts = *starts;
                    config.seed = *seed;
                    config.threshold = *threshold;
                    let res = train_em(&mut hmm, &data, &config)?;
                    println!(
                        "objective={:.6} iterations={} best_start={}",
                        res.objective,
                        res.history.len(),
                        res.best_start
                    );
                    save_model(&hmm, output)?;
                }
                Method::Gradient => {
                    let config = NumericalConfig {
                        max_iterations: *iterations,
                        step_size: *step_size,
                        threshold: *threshold,
                    };
                    let res = train_numerical(&mut hmm, &data, &config)?;
                    println!(
                        "objective={:.6} iterations={}",
                        res.objective,
                        res.history.len()
                    );
                    save_model(&hmm, output)?;
                }
                Method::Gibbs => {
                    let config = GibbsConfig {
                        n_chains: *chains,
                        n_samples: *samples,
                        max_burn_in: *iterations,
                        seed: *seed,
                    };
                    let sampled = SampledHmm::train(&hmm, &data, &config)?;
                    println!("samples={}", sampled.n_samples());
                    sampled.save(output)?;
                }
            }
        }
        Commands::Sample {
            model,
            fasta,
            n,
            seed,
        } => {
            let model = load_model(model)?;
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(*seed);
            for (id, seq) in read_fasta(fasta, &model)? {
                for _ in 0..*n {
                    let path = model.sample_state_path(&seq, &mut rng)?;
                    println!("{}\t{}", id, path_names(&model, &path));
                }
            }
        }
        Commands::Dot { model } => {
            let model = load_model(model)?;
            println!("{}", model.to_dot());
        }
    }
    println!("# finished_at={}", chrono::Local::now());
    Ok(())
}

//! Benchmark and differential-testing harness: drives a random sequence of
//! writes and reads through both the real engine and a `BTreeMap`
//! reference, failing loudly if they disagree (§8 invariant 1).

mod backend;
mod timer;

use clap::Parser;
use rand::{Rng, SeedableRng};

use backend::{Action, Backend};
use timer::Timer;

#[derive(Parser, Debug)]
#[command(about = "arbtrie benchmark / differential-test harness")]
struct Args {
    /// Number of random actions to generate and apply.
    #[arg(long, default_value_t = 10_000)]
    actions: usize,

    /// RNG seed, for reproducible runs.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Maximum key length generated.
    #[arg(long, default_value_t = 16)]
    max_key_len: usize,

    /// Maximum value length generated.
    #[arg(long, default_value_t = 128)]
    max_value_len: usize,

    /// Skip the `BTreeMap` differential check and just report timings.
    #[arg(long)]
    bench_only: bool,
}

fn generate_actions(args: &Args) -> Vec<Action> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let mut keys: Vec<Vec<u8>> = Vec::new();
    (0..args.actions)
        .map(|_| {
            let reuse_existing = !keys.is_empty() && rng.gen_bool(0.6);
            let key = if reuse_existing {
                keys[rng.gen_range(0..keys.len())].clone()
            } else {
                let len = rng.gen_range(1..=args.max_key_len);
                let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                keys.push(key.clone());
                key
            };
            if rng.gen_bool(0.75) {
                let len = rng.gen_range(0..=args.max_value_len);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                Action::Write {
                    key,
                    value: Some(value),
                }
            } else if rng.gen_bool(0.5) {
                Action::Write { key, value: None }
            } else {
                Action::Read { key }
            }
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let actions = generate_actions(&args);

    let dir = tempfile::tempdir()?;
    let mut timer = Timer::new();
    let mut arb = Backend::Arbtrie.instantiate(true, dir.path());
    let arb_reads = arb.apply_actions(actions.clone(), Some(&mut timer));
    println!("{}", timer.report());

    if !args.bench_only {
        let ref_dir = tempfile::tempdir()?;
        let mut reference = Backend::ReferenceMap.instantiate(true, ref_dir.path());
        let ref_reads = reference.apply_actions(actions, None);
        anyhow::ensure!(
            arb_reads == ref_reads,
            "arbtrie and the reference map disagree on {} of {} reads",
            arb_reads
                .iter()
                .zip(ref_reads.iter())
                .filter(|(a, b)| a != b)
                .count(),
            arb_reads.len()
        );
        println!("{} reads verified against the reference map", arb_reads.len());
    }

    Ok(())
}

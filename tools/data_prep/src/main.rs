use clap::Parser;
use log::info;
use std::path::PathBuf;
use trainer::dataset::{self, Cifar10, Split};

/// Fetches (if needed) and verifies the CIFAR-10 binary batches.
#[derive(Parser)]
struct Cli {
    #[arg(short, long, default_value = "./data")]
    root: PathBuf,
    /// Download the archive when the batches are missing.
    #[arg(short, long)]
    download: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    info!("Looking for CIFAR-10 under {:?} (download: {})", cli.root, cli.download);
    let dir = dataset::ensure_available(&cli.root, cli.download)?;
    println!("Found CIFAR-10 batches in {:?}", dir);

    for split in [Split::Train, Split::Test] {
        let data = Cifar10::load(&cli.root, split)?;
        info!("Verified {:?} split: {} records", split, data.len());
        println!("{:?}: {} images", split, data.len());
        for (name, count) in data.classes.iter().zip(data.class_counts()) {
            println!("  {:<12} {}", name, count);
        }
    }
    Ok(())
}

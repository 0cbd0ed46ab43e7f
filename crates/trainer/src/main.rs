use anyhow::{Context, Result};
use std::path::Path;
use tch::nn;

use trainer::metrics::JsonlSink;
use trainer::{make_dataloaders, resolve_device, ExperimentConfig, Trainer};
use vision_core::{weights, DenseNet};

fn main() -> Result<()> {
    env_logger::init();

    let config_path = "configs/training_config.yaml";
    let config = ExperimentConfig::load(config_path)
        .with_context(|| format!("failed to read {config_path}"))?;

    // 1. Device and data
    let device = resolve_device(&config.run.device)?;
    println!("Using device: {:?}", device);
    let (train_feed, val_feed) = make_dataloaders(&config.dataset).context("failed to prepare CIFAR-10")?;

    // 2. Model, starting from pretrained weights when present
    let mut vs = nn::VarStore::new(device);
    let model = DenseNet::new(&vs.root(), &config.model.densenet_config());
    match config.model.pretrained.as_deref() {
        Some(path) if Path::new(path).exists() => {
            weights::load_pretrained(&mut vs, path)
                .with_context(|| format!("failed to load pretrained weights from {path}"))?;
        }
        Some(path) => log::warn!(
            "Pretrained weights {path} not found, training from scratch \
             (export torchvision's DenseNet state_dict to this path to fine-tune)"
        ),
        None => log::info!("No pretrained weights configured, training from scratch"),
    }

    // 3. Train
    let sink = JsonlSink::create(&config.run.log_dir, &config.run.description)?;
    println!("Writing metrics to {:?}", sink.path());
    let summary = Trainer::new(config.run, device, train_feed, val_feed, sink).train(&model, &vs)?;

    println!(
        "Training complete! baseline {:.4} -> best {:.4}, final {:.4}",
        summary.baseline_accuracy, summary.best_accuracy, summary.final_accuracy
    );
    Ok(())
}

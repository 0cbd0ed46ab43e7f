use anyhow::{Context, Result};
use tch::nn;

use trainer::snapshot::WeightSnapshot;
use trainer::{make_dataloaders, resolve_device, test_model, ExperimentConfig, Feed};
use vision_core::DenseNet;

/// Restores the run's best checkpoint and reports validation accuracy.
fn main() -> Result<()> {
    env_logger::init();

    let config = ExperimentConfig::load("configs/training_config.yaml")?;
    let device = resolve_device(&config.run.device)?;
    let (_, mut val_feed) = make_dataloaders(&config.dataset)?;

    let mut vs = nn::VarStore::new(device);
    let model = DenseNet::new(&vs.root(), &config.model.densenet_config());

    let checkpoint = config.run.checkpoint_path();
    let snapshot = WeightSnapshot::load(&checkpoint)
        .with_context(|| format!("failed to load checkpoint {:?}", checkpoint))?;
    snapshot.restore(&mut vs)?;

    let accuracy = test_model(&model, &mut val_feed, device)?;
    println!("{}: accuracy {:.4} on {} images", config.run.description, accuracy, val_feed.num_examples());
    Ok(())
}

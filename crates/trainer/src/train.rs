use std::time::Instant;

use log::info;
use tch::{nn, nn::OptimizerConfig, Device};
use vision_core::{Classifier, Mode};

use crate::error::{Result, TrainError};
use crate::evaluate::{count_correct, test_model};
use crate::loader::Feed;
use crate::metrics::MetricsSink;
use crate::schedule::MultiStepLr;
use crate::snapshot::WeightSnapshot;
use crate::RunConfig;

pub const MOMENTUM: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validation,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Train, Phase::Validation];

    pub fn mode(self) -> Mode {
        match self {
            Phase::Train => Mode::Train,
            Phase::Validation => Mode::Eval,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validation => "val",
        }
    }
}

/// Mean loss and top-1 accuracy of one phase, normalized by the feed size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSummary {
    pub baseline_accuracy: f64,
    pub best_accuracy: f64,
    /// Best accuracy after the baseline and after each validation phase.
    pub best_history: Vec<f64>,
    pub final_accuracy: f64,
    /// Epochs at which the best weights were written; `[0]` for a zero-epoch run.
    pub checkpoint_epochs: Vec<usize>,
    pub optimizer_steps: usize,
}

pub struct Trainer<T: Feed, V: Feed, S: MetricsSink> {
    config: RunConfig,
    device: Device,
    train_feed: T,
    val_feed: V,
    sink: S,
}

impl<T: Feed, V: Feed, S: MetricsSink> Trainer<T, V, S> {
    pub fn new(config: RunConfig, device: Device, train_feed: T, val_feed: V, sink: S) -> Self {
        Self {
            config,
            device,
            train_feed,
            val_feed,
            sink,
        }
    }

    /// Fine-tunes the parameters in `vs` (the variables behind `model`) in
    /// place, keeping the best validation snapshot on disk.
    pub fn train<M: Classifier + ?Sized>(&mut self, model: &M, vs: &nn::VarStore) -> Result<TrainSummary> {
        let mut optimizer = nn::Sgd {
            momentum: MOMENTUM,
            dampening: 0.0,
            wd: self.config.weight_decay,
            nesterov: true,
        }
        .build(vs, self.config.learning_rate)?;
        let mut scheduler = MultiStepLr::new(
            self.config.learning_rate,
            &self.config.milestones,
            MultiStepLr::DEFAULT_GAMMA,
        );
        let checkpoint_path = self.config.checkpoint_path();

        info!("Starting training with configuration: {:?}", self.config);

        let baseline = test_model(model, &mut self.val_feed, self.device)?;
        info!("Baseline validation accuracy: {:.4}", baseline);
        let mut best_accuracy = baseline;
        let mut best = WeightSnapshot::capture(vs, baseline);
        let mut summary = TrainSummary {
            baseline_accuracy: baseline,
            best_history: vec![baseline],
            ..Default::default()
        };

        let epochs = self.config.epochs;
        for epoch in 0..epochs {
            let started = Instant::now();
            let lr = scheduler.step();
            optimizer.set_lr(lr);
            self.sink.add_scalar("learning_rate", lr, epoch)?;

            for phase in Phase::ALL {
                let (metrics, steps) = match phase {
                    Phase::Train => run_phase(model, &mut self.train_feed, phase, &mut optimizer, self.device, epoch)?,
                    Phase::Validation => run_phase(model, &mut self.val_feed, phase, &mut optimizer, self.device, epoch)?,
                };
                summary.optimizer_steps += steps;

                self.sink.add_scalar(&format!("loss/{}", phase.name()), metrics.loss, epoch)?;
                self.sink.add_scalar(&format!("accuracy/{}", phase.name()), metrics.accuracy, epoch)?;
                info!(
                    "Epoch {}/{} | {} | Loss: {:.4} | Acc: {:.4}",
                    epoch + 1,
                    epochs,
                    phase.name(),
                    metrics.loss,
                    metrics.accuracy
                );

                if phase == Phase::Validation {
                    if metrics.accuracy > best_accuracy {
                        best_accuracy = metrics.accuracy;
                        best = WeightSnapshot::capture(vs, best_accuracy);
                        info!("New best validation accuracy: {:.4}", best_accuracy);
                    }
                    summary.best_history.push(best_accuracy);
                }
            }

            if self.config.is_checkpoint_epoch(epoch) {
                best.save(&checkpoint_path)?;
                summary.checkpoint_epochs.push(epoch);
                info!("Saved best weights (acc {:.4}) to {:?}", best_accuracy, checkpoint_path);
            }
            info!("Epoch {} took {:.1}s (lr {:.2e})", epoch + 1, started.elapsed().as_secs_f64(), lr);
        }

        if epochs == 0 {
            best.save(&checkpoint_path)?;
            summary.checkpoint_epochs.push(0);
            info!("No epochs requested; saved baseline weights to {:?}", checkpoint_path);
        }

        let final_accuracy = test_model(model, &mut self.val_feed, self.device)?;
        self.sink
            .add_text("final_accuracy", &format!("{:.4}", final_accuracy), epochs)?;
        self.sink.close()?;
        info!(
            "Training complete: final accuracy {:.4}, best {:.4}",
            final_accuracy, best_accuracy
        );

        summary.best_accuracy = best_accuracy;
        summary.final_accuracy = final_accuracy;
        Ok(summary)
    }
}

/// One pass over `feed`. In the training phase gradients are cleared before
/// every forward pass and one optimizer step follows each batch; validation
/// runs without gradient tracking.
fn run_phase<M, F>(
    model: &M,
    feed: &mut F,
    phase: Phase,
    optimizer: &mut nn::Optimizer,
    device: Device,
    epoch: usize,
) -> Result<(PhaseMetrics, usize)>
where
    M: Classifier + ?Sized,
    F: Feed + ?Sized,
{
    let total = feed.num_examples();
    if total == 0 {
        return Err(TrainError::EmptyFeed);
    }

    let mode = phase.mode();
    let _guard = (!mode.is_train()).then(tch::no_grad_guard);

    let mut running_loss = 0.0;
    let mut correct = 0;
    let mut steps = 0;
    for (index, batch) in feed.batches()?.enumerate() {
        let batch = batch?.to_device(device);
        if mode.is_train() {
            optimizer.zero_grad();
        }

        let logits = model.forward(&batch.images, mode);
        let loss = logits.cross_entropy_for_logits(&batch.labels);
        let loss_value = loss.double_value(&[]);
        if !loss_value.is_finite() {
            return Err(TrainError::Divergence { epoch, batch: index });
        }

        if mode.is_train() {
            loss.backward();
            optimizer.step();
            steps += 1;
        }

        running_loss += loss_value * batch.len() as f64;
        correct += count_correct(&logits, &batch.labels);
    }

    let metrics = PhaseMetrics {
        loss: running_loss / total as f64,
        accuracy: correct as f64 / total as f64,
    };
    Ok((metrics, steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Event, MemorySink};
    use crate::testing::{feed_from, CountingFeed, LinearProbe};
    use crate::ImageFeed;
    use tch::Tensor;
    use tempfile::TempDir;

    /// Dark images are class 0, bright images class 1.
    fn two_class_feed(batch_size: usize) -> ImageFeed {
        feed_from(
            &[10, 20, 30, 40, 210, 220, 230, 240],
            &[0, 0, 0, 0, 1, 1, 1, 1],
            batch_size,
        )
    }

    fn run_config(tmp: &TempDir, epochs: usize) -> RunConfig {
        RunConfig {
            description: "probe".to_string(),
            device: "cpu".to_string(),
            epochs,
            learning_rate: 0.5,
            weight_decay: 0.0,
            milestones: vec![],
            checkpoint_every: 2,
            state_dict_path: format!("{}/best_", tmp.path().display()),
            log_dir: tmp.path().join("runs").display().to_string(),
        }
    }

    #[test]
    fn every_epoch_visits_both_feeds_once() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let mut train = CountingFeed::new(two_class_feed(3));
        let mut val = CountingFeed::new(two_class_feed(8));
        let mut sink = MemorySink::default();

        let summary = Trainer::new(run_config(&tmp, 3), Device::Cpu, &mut train, &mut val, &mut sink)
            .train(&model, &vs)
            .unwrap();

        assert_eq!(train.epochs, 3);
        // Baseline and final evaluation come on top of the per-epoch passes.
        assert_eq!(val.epochs, 3 + 2);
        assert_eq!(summary.optimizer_steps, 3 * 3);
    }

    #[test]
    fn best_accuracy_never_decreases_and_starts_at_baseline() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let mut sink = MemorySink::default();

        let summary = Trainer::new(run_config(&tmp, 6), Device::Cpu, two_class_feed(4), two_class_feed(4), &mut sink)
            .train(&model, &vs)
            .unwrap();

        assert_eq!(summary.best_history.len(), 7);
        assert_eq!(summary.best_history[0], summary.baseline_accuracy);
        assert!(summary.best_history.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(summary.best_accuracy, *summary.best_history.last().unwrap());

        let val_acc = sink.scalars("accuracy/val");
        let max_val = val_acc.iter().map(|(_, a)| *a).fold(summary.baseline_accuracy, f64::max);
        assert_eq!(summary.best_accuracy, max_val);
    }

    #[test]
    fn checkpoints_follow_interval_and_final_epoch() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let config = RunConfig {
            checkpoint_every: 3,
            ..run_config(&tmp, 5)
        };
        let path = config.checkpoint_path();

        let summary = Trainer::new(config, Device::Cpu, two_class_feed(4), two_class_feed(4), MemorySink::default())
            .train(&model, &vs)
            .unwrap();

        assert_eq!(summary.checkpoint_epochs, vec![0, 3, 4]);
        assert!(path.ends_with("best_probe.pt"));
        let saved = WeightSnapshot::load(&path).unwrap();
        assert_eq!(saved.len(), 2);
    }

    #[test]
    fn checkpoint_holds_the_best_weights_not_the_latest() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        // Separates dark (class 0) from bright (class 1) before any step.
        tch::no_grad(|| {
            let mut variables = vs.variables();
            let weight = Tensor::from_slice(&[-10f32, -10., -10., 10., 10., 10.]).view([2, 3]);
            variables.get_mut("probe.weight").unwrap().copy_(&weight);
            variables.get_mut("probe.bias").unwrap().copy_(&Tensor::from_slice(&[15f32, -15.]));
        });
        let initial = WeightSnapshot::capture(&vs, 1.0);

        // Training labels are the inverse of the validation labels.
        let inverted = feed_from(
            &[10, 20, 30, 40, 210, 220, 230, 240],
            &[1, 1, 1, 1, 0, 0, 0, 0],
            4,
        );
        let config = RunConfig {
            checkpoint_every: 1,
            ..run_config(&tmp, 4)
        };
        let path = config.checkpoint_path();

        let summary = Trainer::new(config, Device::Cpu, inverted, two_class_feed(8), MemorySink::default())
            .train(&model, &vs)
            .unwrap();

        assert_eq!(summary.baseline_accuracy, 1.0);
        assert!(summary.best_history.iter().all(|&a| a == 1.0));
        assert_eq!(summary.checkpoint_epochs, vec![0, 1, 2, 3]);

        let saved = WeightSnapshot::load(&path).unwrap();
        let live = vs.variables();
        for name in ["probe.weight", "probe.bias"] {
            let stored = saved.get(name).unwrap();
            assert!(stored.equal(initial.get(name).unwrap()), "{name} is not the best snapshot");
            assert!(!stored.equal(&live[name]), "{name} matches the trained weights");
        }
    }

    #[test]
    fn zero_epochs_evaluates_checkpoints_once_and_never_steps() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let before = WeightSnapshot::capture(&vs, 0.0);
        let config = run_config(&tmp, 0);
        let path = config.checkpoint_path();
        let mut train = CountingFeed::new(two_class_feed(4));
        let mut sink = MemorySink::default();

        let summary = Trainer::new(config, Device::Cpu, &mut train, two_class_feed(4), &mut sink)
            .train(&model, &vs)
            .unwrap();

        assert_eq!(train.epochs, 0);
        assert_eq!(summary.optimizer_steps, 0);
        assert_eq!(summary.checkpoint_epochs, vec![0]);
        assert!(path.exists());
        assert_eq!(summary.final_accuracy, summary.baseline_accuracy);
        let variables = vs.variables();
        assert!(variables["probe.weight"].equal(before.get("probe.weight").unwrap()));
        assert!(sink.closed);
    }

    #[test]
    fn metrics_are_tagged_by_phase_and_epoch() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let mut sink = MemorySink::default();

        Trainer::new(run_config(&tmp, 2), Device::Cpu, two_class_feed(4), two_class_feed(4), &mut sink)
            .train(&model, &vs)
            .unwrap();

        for tag in ["loss/train", "accuracy/train", "loss/val", "accuracy/val"] {
            let steps: Vec<usize> = sink.scalars(tag).iter().map(|(s, _)| *s).collect();
            assert_eq!(steps, vec![0, 1], "{tag}");
        }
        assert!(sink
            .events
            .iter()
            .any(|e| matches!(e, Event::Text { tag, step: 2, .. } if tag == "final_accuracy")));
        assert!(sink.closed);
    }

    #[test]
    fn scheduler_steps_before_the_first_training_phase() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let config = RunConfig {
            learning_rate: 0.1,
            milestones: vec![1, 3],
            ..run_config(&tmp, 3)
        };
        let mut sink = MemorySink::default();

        Trainer::new(config, Device::Cpu, two_class_feed(4), two_class_feed(4), &mut sink)
            .train(&model, &vs)
            .unwrap();

        let lrs: Vec<f64> = sink.scalars("learning_rate").iter().map(|(_, lr)| *lr).collect();
        let expected = [0.01, 0.01, 0.001];
        for (got, want) in lrs.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{lrs:?}");
        }
    }

    #[test]
    fn training_reduces_loss_on_separable_data() {
        tch::manual_seed(1);
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = LinearProbe::new(&vs.root(), 2);
        let mut sink = MemorySink::default();

        Trainer::new(run_config(&tmp, 20), Device::Cpu, two_class_feed(4), two_class_feed(8), &mut sink)
            .train(&model, &vs)
            .unwrap();

        let losses = sink.scalars("loss/train");
        assert!(losses.last().unwrap().1 < losses.first().unwrap().1, "{losses:?}");
    }

    struct NanProbe(LinearProbe);

    impl Classifier for NanProbe {
        fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
            self.0.forward(xs, mode) * f64::NAN
        }
    }

    #[test]
    fn non_finite_loss_aborts_the_run() {
        let tmp = TempDir::new().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = NanProbe(LinearProbe::new(&vs.root(), 2));

        let result = Trainer::new(run_config(&tmp, 2), Device::Cpu, two_class_feed(4), two_class_feed(4), MemorySink::default())
            .train(&model, &vs);
        assert!(matches!(result, Err(TrainError::Divergence { epoch: 0, batch: 0 })));
    }
}

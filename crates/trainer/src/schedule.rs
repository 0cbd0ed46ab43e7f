/// Multiplies the learning rate by `gamma` each time the epoch counter
/// reaches a milestone.
///
/// Construction counts as epoch 0; every `step()` advances the counter by
/// one. A milestone listed twice decays twice.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: usize,
}

impl MultiStepLr {
    pub const DEFAULT_GAMMA: f64 = 0.1;

    pub fn new(base_lr: f64, milestones: &[usize], gamma: f64) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        Self {
            base_lr,
            milestones,
            gamma,
            last_epoch: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        let decays = self.milestones.iter().take_while(|&&m| m <= self.last_epoch).count();
        self.base_lr * self.gamma.powi(decays as i32)
    }

    /// Advances one epoch and returns the learning rate now in effect.
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.lr()
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}

use tch::Tensor;

/// Whether a forward pass is part of optimization or inference.
///
/// Passed explicitly to every forward call instead of living as a flag on the
/// model: `Train` enables dropout and batch-norm statistic updates, `Eval`
/// uses the running statistics and disables dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// A network mapping an image batch `[N, C, H, W]` to class scores `[N, K]`.
pub trait Classifier {
    fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor;
}

impl<T: Classifier + ?Sized> Classifier for &T {
    fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        (**self).forward(xs, mode)
    }
}

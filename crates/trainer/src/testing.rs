//! Small models and feeds shared by the unit tests.

use tch::{nn, Kind, Tensor};
use vision_core::{Classifier, Mode};

use crate::error::Result;
use crate::loader::{BatchIter, Feed, ImageFeed};
use crate::transforms::Transform;

/// Scales u8 pixels to [0, 1] and nothing else.
pub(crate) fn identity() -> Transform {
    Transform {
        mean: [0.0; 3],
        std: [1.0; 3],
        ..Transform::eval()
    }
}

/// Image `i` is a 3x32x32 block filled with `pixels[i]`.
pub(crate) fn feed_from(pixels: &[u8], labels: &[i64], batch_size: usize) -> ImageFeed {
    let n = labels.len() as i64;
    let images = Tensor::from_slice(pixels)
        .view([n, 1, 1, 1])
        .expand([n, 3, 32, 32], false)
        .contiguous();
    ImageFeed::new(images, Tensor::from_slice(labels), batch_size, identity())
}

/// Always predicts the same class.
pub(crate) struct ConstantClassifier {
    class: i64,
    num_classes: i64,
}

impl ConstantClassifier {
    pub(crate) fn new(class: i64, num_classes: i64) -> Self {
        Self { class, num_classes }
    }
}

impl Classifier for ConstantClassifier {
    fn forward(&self, xs: &Tensor, _mode: Mode) -> Tensor {
        let n = xs.size()[0];
        Tensor::full([n], self.class, (Kind::Int64, xs.device()))
            .one_hot(self.num_classes)
            .to_kind(Kind::Float)
    }
}

/// Predicts the class equal to the image's (unscaled) pixel value, clamped to 0..=9.
pub(crate) struct PixelClassifier;

impl Classifier for PixelClassifier {
    fn forward(&self, xs: &Tensor, _mode: Mode) -> Tensor {
        (xs.mean_dim(Some(&[1i64, 2, 3][..]), false, Kind::Float) * 255.0)
            .round()
            .to_kind(Kind::Int64)
            .clamp(0, 9)
            .one_hot(10)
            .to_kind(Kind::Float)
    }
}

/// Global average pool followed by a linear layer: trainable and tiny.
pub(crate) struct LinearProbe {
    linear: nn::Linear,
}

impl LinearProbe {
    pub(crate) fn new(vs: &nn::Path, num_classes: i64) -> Self {
        Self {
            linear: nn::linear(vs / "probe", 3, num_classes, Default::default()),
        }
    }
}

impl Classifier for LinearProbe {
    fn forward(&self, xs: &Tensor, _mode: Mode) -> Tensor {
        xs.adaptive_avg_pool2d([1, 1]).flatten(1, -1).apply(&self.linear)
    }
}

/// Counts how many epochs were started on the wrapped feed.
pub(crate) struct CountingFeed<F> {
    pub(crate) inner: F,
    pub(crate) epochs: usize,
}

impl<F> CountingFeed<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self { inner, epochs: 0 }
    }
}

impl<F: Feed> Feed for CountingFeed<F> {
    fn num_examples(&self) -> usize {
        self.inner.num_examples()
    }

    fn batches(&mut self) -> Result<BatchIter<'_>> {
        self.epochs += 1;
        self.inner.batches()
    }
}

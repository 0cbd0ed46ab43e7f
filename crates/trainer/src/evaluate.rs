use log::debug;
use tch::{Device, Kind, Tensor};
use vision_core::{Classifier, Mode};

use crate::error::{Result, TrainError};
use crate::loader::Feed;

/// Mean top-1 accuracy of `model` over one pass of `feed`.
///
/// Runs in `Mode::Eval` with gradient tracking disabled, so neither the
/// parameters nor the batch-norm statistics change.
pub fn test_model<M, F>(model: &M, feed: &mut F, device: Device) -> Result<f64>
where
    M: Classifier + ?Sized,
    F: Feed + ?Sized,
{
    let total = feed.num_examples();
    if total == 0 {
        return Err(TrainError::EmptyFeed);
    }

    let _guard = tch::no_grad_guard();
    let mut correct = 0;
    for batch in feed.batches()? {
        let batch = batch?.to_device(device);
        let logits = model.forward(&batch.images, Mode::Eval);
        correct += count_correct(&logits, &batch.labels);
    }

    let accuracy = correct as f64 / total as f64;
    debug!("Evaluated {} examples: {}/{} correct", total, correct, total);
    Ok(accuracy)
}

/// Number of rows whose highest score is at the label's index.
pub(crate) fn count_correct(logits: &Tensor, labels: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[])
}

use tch::{nn, Tensor};

use crate::config::DenseNetConfig;
use crate::mode::{Classifier, Mode};

fn conv2d(vs: nn::Path, c_in: i64, c_out: i64, ksize: i64, padding: i64, stride: i64) -> nn::Conv2D {
    let conv_config = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(vs, c_in, c_out, ksize, conv_config)
}

/// BN-ReLU-Conv1x1 bottleneck followed by BN-ReLU-Conv3x3; the output is
/// concatenated onto the input along the channel axis.
pub struct DenseLayer {
    norm1: nn::BatchNorm,
    conv1: nn::Conv2D,
    norm2: nn::BatchNorm,
    conv2: nn::Conv2D,
    drop_rate: f64,
}

impl DenseLayer {
    pub fn new(vs: &nn::Path, c_in: i64, config: &DenseNetConfig) -> Self {
        let bottleneck = config.bn_size * config.growth_rate;
        Self {
            norm1: nn::batch_norm2d(vs / "norm1", c_in, Default::default()),
            conv1: conv2d(vs / "conv1", c_in, bottleneck, 1, 0, 1),
            norm2: nn::batch_norm2d(vs / "norm2", bottleneck, Default::default()),
            conv2: conv2d(vs / "conv2", bottleneck, config.growth_rate, 3, 1, 1),
            drop_rate: config.drop_rate,
        }
    }

    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        let train = mode.is_train();
        let ys = xs
            .apply_t(&self.norm1, train)
            .relu()
            .apply(&self.conv1)
            .apply_t(&self.norm2, train)
            .relu()
            .apply(&self.conv2);
        let ys = if self.drop_rate > 0.0 {
            ys.dropout(self.drop_rate, train)
        } else {
            ys
        };
        Tensor::cat(&[xs, &ys], 1)
    }
}

pub struct DenseBlock {
    layers: Vec<DenseLayer>,
}

impl DenseBlock {
    pub fn new(vs: &nn::Path, c_in: i64, n_layers: i64, config: &DenseNetConfig) -> Self {
        let layers = (0..n_layers)
            .map(|i| {
                DenseLayer::new(
                    &(vs / format!("denselayer{}", i + 1)),
                    c_in + i * config.growth_rate,
                    config,
                )
            })
            .collect();
        Self { layers }
    }

    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        let mut features = xs.shallow_clone();
        for layer in &self.layers {
            features = layer.forward(&features, mode);
        }
        features
    }
}

/// BN-ReLU-Conv1x1 halving the channels, then 2x2 average pooling.
pub struct Transition {
    norm: nn::BatchNorm,
    conv: nn::Conv2D,
}

impl Transition {
    pub fn new(vs: &nn::Path, c_in: i64, c_out: i64) -> Self {
        Self {
            norm: nn::batch_norm2d(vs / "norm", c_in, Default::default()),
            conv: conv2d(vs / "conv", c_in, c_out, 1, 0, 1),
        }
    }

    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        xs.apply_t(&self.norm, mode.is_train())
            .relu()
            .apply(&self.conv)
            .avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>)
    }
}

/// DenseNet-BC with variable names matching torchvision's state dict
/// (`features.denseblock1.denselayer1.norm1.weight`, `classifier.bias`, ...),
/// so published weights load without renaming.
///
/// The head uses adaptive average pooling, which keeps 32x32 inputs valid.
pub struct DenseNet {
    conv0: nn::Conv2D,
    norm0: nn::BatchNorm,
    blocks: Vec<(DenseBlock, Option<Transition>)>,
    norm5: nn::BatchNorm,
    classifier: nn::Linear,
    pub config: DenseNetConfig,
}

impl DenseNet {
    pub fn new(vs: &nn::Path, config: &DenseNetConfig) -> Self {
        let features = vs / "features";
        let conv0 = conv2d(&features / "conv0", 3, config.num_init_features, 7, 3, 2);
        let norm0 = nn::batch_norm2d(&features / "norm0", config.num_init_features, Default::default());

        let mut channels = config.num_init_features;
        let mut blocks = Vec::with_capacity(config.block_config.len());
        for (i, &n_layers) in config.block_config.iter().enumerate() {
            let block = DenseBlock::new(
                &(&features / format!("denseblock{}", i + 1)),
                channels,
                n_layers,
                config,
            );
            channels += n_layers * config.growth_rate;

            let transition = if i + 1 != config.block_config.len() {
                let t = Transition::new(
                    &(&features / format!("transition{}", i + 1)),
                    channels,
                    channels / 2,
                );
                channels /= 2;
                Some(t)
            } else {
                None
            };
            blocks.push((block, transition));
        }

        let norm5 = nn::batch_norm2d(&features / "norm5", channels, Default::default());
        let classifier = nn::linear(vs / "classifier", channels, config.num_classes, Default::default());

        Self {
            conv0,
            norm0,
            blocks,
            norm5,
            classifier,
            config: config.clone(),
        }
    }
}

impl Classifier for DenseNet {
    fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        let train = mode.is_train();
        let mut x = xs
            .apply(&self.conv0)
            .apply_t(&self.norm0, train)
            .relu()
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);

        for (block, transition) in &self.blocks {
            x = block.forward(&x, mode);
            if let Some(t) = transition {
                x = t.forward(&x, mode);
            }
        }

        x.apply_t(&self.norm5, train)
            .relu()
            .adaptive_avg_pool2d([1, 1])
            .flatten(1, -1)
            .apply(&self.classifier)
    }
}

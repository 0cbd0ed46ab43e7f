use serde::{Deserialize, Serialize};

/// The torchvision DenseNet family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Densenet121,
    Densenet161,
    Densenet169,
    Densenet201,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseNetConfig {
    /// Channels added by every dense layer.
    pub growth_rate: i64,
    /// Number of dense layers in each dense block.
    pub block_config: Vec<i64>,
    /// Channels produced by the stem convolution.
    pub num_init_features: i64,
    /// Bottleneck width multiplier (bottleneck = bn_size * growth_rate).
    pub bn_size: i64,
    /// Dropout applied after each dense layer while training.
    pub drop_rate: f64,
    /// Size of the classifier output.
    pub num_classes: i64,
}

impl DenseNetConfig {
    pub fn for_variant(variant: Variant, num_classes: i64) -> Self {
        let (growth_rate, block_config, num_init_features) = match variant {
            Variant::Densenet121 => (32, vec![6, 12, 24, 16], 64),
            Variant::Densenet161 => (48, vec![6, 12, 36, 24], 96),
            Variant::Densenet169 => (32, vec![6, 12, 32, 32], 64),
            Variant::Densenet201 => (32, vec![6, 12, 48, 32], 64),
        };
        Self {
            growth_rate,
            block_config,
            num_init_features,
            bn_size: 4,
            drop_rate: 0.0,
            num_classes,
        }
    }

    pub fn with_drop_rate(mut self, drop_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    /// Channels entering the classifier after the last dense block.
    pub fn num_features(&self) -> i64 {
        let mut features = self.num_init_features;
        let last = self.block_config.len().saturating_sub(1);
        for (i, &layers) in self.block_config.iter().enumerate() {
            features += layers * self.growth_rate;
            if i != last {
                features /= 2;
            }
        }
        features
    }
}

impl Default for DenseNetConfig {
    fn default() -> Self {
        Self::for_variant(Variant::default(), 10)
    }
}

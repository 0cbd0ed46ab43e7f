use rand::Rng;
use tch::{Kind, Tensor};

/// Per-channel statistics of the CIFAR-10 training images.
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR10_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomCrop {
    pub size: i64,
    /// Zero padding added on every side before cropping.
    pub padding: i64,
}

/// Per-batch image pipeline: optional random crop and horizontal flip, then
/// u8 → f32 in [0, 1] and per-channel normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub crop: Option<RandomCrop>,
    pub horizontal_flip: bool,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Transform {
    pub fn train() -> Self {
        Self {
            crop: Some(RandomCrop { size: 32, padding: 4 }),
            horizontal_flip: true,
            mean: CIFAR10_MEAN,
            std: CIFAR10_STD,
        }
    }

    pub fn eval() -> Self {
        Self {
            crop: None,
            horizontal_flip: false,
            mean: CIFAR10_MEAN,
            std: CIFAR10_STD,
        }
    }

    pub fn is_random(&self) -> bool {
        self.crop.is_some() || self.horizontal_flip
    }

    /// `images` is a `[N, 3, H, W]` u8 batch on the CPU.
    pub fn apply<R: Rng>(&self, images: &Tensor, rng: &mut R) -> Tensor {
        let xs = images.to_kind(Kind::Float) / 255.0;
        let xs = if self.is_random() { self.augment(&xs, rng) } else { xs };
        self.normalize(&xs)
    }

    fn augment<R: Rng>(&self, xs: &Tensor, rng: &mut R) -> Tensor {
        let padded = match self.crop {
            Some(crop) if crop.padding > 0 => xs.zero_pad2d(crop.padding, crop.padding, crop.padding, crop.padding),
            _ => xs.shallow_clone(),
        };

        let n = padded.size()[0];
        let items: Vec<Tensor> = (0..n)
            .map(|i| {
                let mut img = padded.get(i);
                if let Some(crop) = self.crop {
                    let (_, h, w) = img.size3().unwrap_or((0, crop.size, crop.size));
                    let dy = rng.gen_range(0..=(h - crop.size).max(0));
                    let dx = rng.gen_range(0..=(w - crop.size).max(0));
                    img = img.narrow(1, dy, crop.size).narrow(2, dx, crop.size);
                }
                if self.horizontal_flip && rng.gen_bool(0.5) {
                    img = img.flip([2]);
                }
                img
            })
            .collect();
        Tensor::stack(&items, 0)
    }

    fn normalize(&self, xs: &Tensor) -> Tensor {
        let device = xs.device();
        let mean = Tensor::from_slice(&self.mean).view([1, 3, 1, 1]).to_device(device);
        let std = Tensor::from_slice(&self.std).view([1, 3, 1, 1]).to_device(device);
        (xs - mean) / std
    }
}

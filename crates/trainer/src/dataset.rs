use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use tch::Tensor;

use crate::error::{Result, TrainError};
use crate::loader::ImageFeed;
use crate::transforms::Transform;
use crate::DataConfig;

pub const CLASSES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub const ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
pub const ARCHIVE_NAME: &str = "cifar-10-binary.tar.gz";
pub const BATCH_DIR: &str = "cifar-10-batches-bin";
pub const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
pub const TEST_FILE: &str = "test_batch.bin";
const META_FILE: &str = "batches.meta.txt";

pub const CHANNELS: i64 = 3;
pub const SIDE: i64 = 32;
/// Label byte followed by the red, green and blue planes.
pub const RECORD_BYTES: usize = 1 + (CHANNELS * SIDE * SIDE) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn files(self) -> &'static [&'static str] {
        match self {
            Split::Train => &TRAIN_FILES,
            Split::Test => std::slice::from_ref(&TEST_FILE),
        }
    }
}

/// One partition of CIFAR-10 held in memory as raw bytes.
pub struct Cifar10 {
    /// `[N, 3, 32, 32]` u8.
    pub images: Tensor,
    /// `[N]` int64.
    pub labels: Tensor,
    pub classes: Vec<String>,
}

impl Cifar10 {
    /// Reads a split from `root`, which is either the extracted
    /// `cifar-10-batches-bin` directory or its parent.
    pub fn load<P: AsRef<Path>>(root: P, split: Split) -> Result<Self> {
        let root = root.as_ref();
        let dir = locate(root).ok_or_else(|| TrainError::DatasetNotFound {
            path: root.join(BATCH_DIR),
        })?;

        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for name in split.files() {
            read_batch_file(&dir.join(name), &mut pixels, &mut labels)?;
        }

        let n = labels.len() as i64;
        Ok(Self {
            images: Tensor::from_slice(&pixels).view([n, CHANNELS, SIDE, SIDE]),
            labels: Tensor::from_slice(&labels),
            classes: read_class_names(&dir),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Examples per class, indexed by label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len().max(CLASSES.len())];
        if let Ok(labels) = Vec::<i64>::try_from(&self.labels) {
            for label in labels {
                counts[label as usize] += 1;
            }
        }
        counts
    }
}

/// Finds the directory holding the batch files under `root`.
pub fn locate(root: &Path) -> Option<PathBuf> {
    [root.join(BATCH_DIR), root.to_path_buf()]
        .into_iter()
        .find(|dir| dir.join(TEST_FILE).is_file())
}

fn read_batch_file(path: &Path, pixels: &mut Vec<u8>, labels: &mut Vec<i64>) -> Result<()> {
    if !path.is_file() {
        return Err(TrainError::DatasetNotFound {
            path: path.to_path_buf(),
        });
    }
    let buffer = fs::read(path)?;
    if buffer.is_empty() || buffer.len() % RECORD_BYTES != 0 {
        return Err(TrainError::CorruptDataset {
            path: path.to_path_buf(),
            reason: format!("{} bytes is not a whole number of {}-byte records", buffer.len(), RECORD_BYTES),
        });
    }

    for record in buffer.chunks_exact(RECORD_BYTES) {
        let label = record[0];
        if label as usize >= CLASSES.len() {
            return Err(TrainError::CorruptDataset {
                path: path.to_path_buf(),
                reason: format!("label {label} out of range"),
            });
        }
        labels.push(label as i64);
        // Planes are already stored channel-major, matching [C, H, W].
        pixels.extend_from_slice(&record[1..]);
    }
    Ok(())
}

fn read_class_names(dir: &Path) -> Vec<String> {
    let names: Vec<String> = fs::read_to_string(dir.join(META_FILE))
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if names.len() == CLASSES.len() {
        names
    } else {
        CLASSES.iter().map(|s| s.to_string()).collect()
    }
}

/// Downloads and unpacks the binary archive into `root`, skipping whichever
/// step has already been done.
pub fn download<P: AsRef<Path>>(root: P) -> Result<()> {
    let root = root.as_ref();
    fs::create_dir_all(root)?;

    let archive = root.join(ARCHIVE_NAME);
    if archive.exists() {
        info!("CIFAR-10 archive already at {:?}, skipping download", archive);
    } else {
        info!("Downloading CIFAR-10 from {}", ARCHIVE_URL);
        let response = reqwest::blocking::get(ARCHIVE_URL)
            .and_then(|r| r.error_for_status())
            .map_err(|e| TrainError::Download(e.to_string()))?;
        let bytes = response.bytes().map_err(|e| TrainError::Download(e.to_string()))?;

        // Renamed into place only once the body is fully written.
        let partial = root.join(format!("{ARCHIVE_NAME}.part"));
        File::create(&partial)?.write_all(&bytes)?;
        fs::rename(&partial, &archive)?;
        info!("Downloaded {} bytes", bytes.len());
    }

    if locate(root).is_some() {
        info!("CIFAR-10 already extracted under {:?}", root);
    } else {
        info!("Extracting {:?}", archive);
        let decoder = flate2::read::GzDecoder::new(File::open(&archive)?);
        tar::Archive::new(decoder).unpack(root)?;
    }
    Ok(())
}

/// Returns the batch directory, downloading the archive first if allowed.
pub fn ensure_available(root: &Path, allow_download: bool) -> Result<PathBuf> {
    if let Some(dir) = locate(root) {
        return Ok(dir);
    }
    if !allow_download {
        return Err(TrainError::DatasetNotFound {
            path: root.join(BATCH_DIR).join(TEST_FILE),
        });
    }
    download(root)?;
    locate(root).ok_or_else(|| TrainError::DatasetNotFound {
        path: root.join(BATCH_DIR),
    })
}

/// Builds the training feed (random crop + flip, shuffled every epoch) and
/// the validation feed (normalization only, fixed order).
pub fn make_dataloaders(config: &DataConfig) -> Result<(ImageFeed, ImageFeed)> {
    config.validate()?;
    let root = Path::new(&config.root);
    ensure_available(root, config.download)?;

    let train = Cifar10::load(root, Split::Train)?;
    let test = Cifar10::load(root, Split::Test)?;
    info!(
        "Loaded CIFAR-10 from {:?}: {} train / {} test images",
        root,
        train.len(),
        test.len()
    );

    let train_feed = ImageFeed::new(train.images, train.labels, config.batch_size, Transform::train())
        .shuffle(true)
        .num_workers(config.num_workers)
        .seed(config.seed);
    let val_feed = ImageFeed::new(test.images, test.labels, config.batch_size, Transform::eval())
        .num_workers(config.num_workers)
        .seed(config.seed.map(|s| s.wrapping_add(1)));

    Ok((train_feed, val_feed))
}

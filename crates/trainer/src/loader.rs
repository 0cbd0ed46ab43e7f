use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Device, Tensor};

use crate::error::{Result, TrainError};
use crate::transforms::Transform;

/// One mini-batch: `images` is `[N, 3, H, W]` float, `labels` is `[N]` int64.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.size().first().copied().unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            images: self.images.to_device(device),
            labels: self.labels.to_device(device),
        }
    }
}

/// Finished batches each background worker may hold before it blocks.
pub const PREFETCH_PER_WORKER: usize = 2;

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// A restartable source of mini-batches.
pub trait Feed {
    /// Examples in one full epoch.
    fn num_examples(&self) -> usize;

    /// Starts a new epoch.
    fn batches(&mut self) -> Result<BatchIter<'_>>;
}

impl<F: Feed + ?Sized> Feed for &mut F {
    fn num_examples(&self) -> usize {
        (**self).num_examples()
    }

    fn batches(&mut self) -> Result<BatchIter<'_>> {
        (**self).batches()
    }
}

/// Batches an in-memory u8 image tensor through a [`Transform`].
pub struct ImageFeed {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    transform: Transform,
    rng: StdRng,
}

impl ImageFeed {
    /// `images` is `[N, 3, H, W]` u8 on the CPU, `labels` is `[N]` int64.
    pub fn new(images: Tensor, labels: Tensor, batch_size: usize, transform: Transform) -> Self {
        if batch_size == 0 {
            warn!("Batch size 0 requested, using 1");
        }
        Self {
            images,
            labels,
            batch_size: batch_size.max(1),
            shuffle: false,
            num_workers: 0,
            transform,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn num_batches(&self) -> usize {
        self.num_examples().div_ceil(self.batch_size)
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    fn epoch_plan(&mut self) -> Vec<Vec<i64>> {
        let mut order: Vec<i64> = (0..self.num_examples() as i64).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order.chunks(self.batch_size).map(<[i64]>::to_vec).collect()
    }

    fn spawn_workers(&mut self, plan: Vec<Vec<i64>>) -> Result<WorkerPool> {
        let n = self.num_workers;
        let total = plan.len();
        let plan = Arc::new(plan);

        let mut receivers = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for w in 0..n {
            let (tx, rx) = mpsc::sync_channel(PREFETCH_PER_WORKER);
            let plan = Arc::clone(&plan);
            let images = self.images.shallow_clone();
            let labels = self.labels.shallow_clone();
            let transform = self.transform.clone();
            let mut rng = StdRng::seed_from_u64(self.rng.gen());

            let handle = thread::Builder::new()
                .name(format!("feed-worker-{w}"))
                .spawn(move || {
                    for i in (w..plan.len()).step_by(n) {
                        let batch = build_batch(&images, &labels, &plan[i], &transform, &mut rng);
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                })?;
            receivers.push(rx);
            handles.push(handle);
        }

        Ok(WorkerPool {
            receivers,
            handles,
            next: 0,
            total,
        })
    }
}

impl Feed for ImageFeed {
    fn num_examples(&self) -> usize {
        self.labels.size().first().copied().unwrap_or(0) as usize
    }

    fn batches(&mut self) -> Result<BatchIter<'_>> {
        let plan = self.epoch_plan();
        if self.num_workers > 0 {
            return Ok(Box::new(self.spawn_workers(plan)?));
        }

        let images = &self.images;
        let labels = &self.labels;
        let transform = &self.transform;
        let rng = &mut self.rng;
        Ok(Box::new(
            plan.into_iter()
                .map(move |indices| Ok(build_batch(images, labels, &indices, transform, rng))),
        ))
    }
}

fn build_batch(images: &Tensor, labels: &Tensor, indices: &[i64], transform: &Transform, rng: &mut StdRng) -> Batch {
    let index = Tensor::from_slice(indices);
    Batch {
        images: transform.apply(&images.index_select(0, &index), rng),
        labels: labels.index_select(0, &index),
    }
}

/// Worker `w` of `n` builds batches `w, w + n, ...` into its own bounded
/// channel, so batch `i` is always read from worker `i % n` and at most
/// `PREFETCH_PER_WORKER` finished batches wait per worker.
struct WorkerPool {
    receivers: Vec<Receiver<Batch>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
    total: usize,
}

impl Iterator for WorkerPool {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        let rx = self.receivers.get(index % self.receivers.len())?;
        match rx.recv() {
            Ok(batch) => {
                self.next += 1;
                Some(Ok(batch))
            }
            Err(_) => {
                self.next = self.total;
                Some(Err(TrainError::Worker(format!(
                    "worker {} exited before producing batch {index}",
                    index % self.receivers.len()
                ))))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect first so workers blocked on a full channel exit.
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

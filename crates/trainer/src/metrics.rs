use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Destination for per-epoch scalars and run annotations.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
    fn add_text(&mut self, tag: &str, text: &str, step: usize) -> Result<()>;
    /// Flushes buffered events; nothing may be written afterwards.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Scalar {
        tag: String,
        step: usize,
        value: f64,
        wall_time: f64,
    },
    Text {
        tag: String,
        step: usize,
        text: String,
        wall_time: f64,
    },
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Appends one JSON object per event to `<log_dir>/<run>/events.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(log_dir: P, run: &str) -> Result<Self> {
        let dir = log_dir.as_ref().join(run);
        fs::create_dir_all(&dir)?;
        let path = dir.join("events.jsonl");
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, event: &Event) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "metrics sink already closed")
        })?;
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Reads back every event in a log file.
    pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Event>> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(TrainError::from))
            .collect()
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write(&Event::Scalar {
            tag: tag.to_string(),
            step,
            value,
            wall_time: wall_time(),
        })
    }

    fn add_text(&mut self, tag: &str, text: &str, step: usize) -> Result<()> {
        self.write(&Event::Text {
            tag: tag.to_string(),
            step,
            text: text.to_string(),
            wall_time: wall_time(),
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Keeps events in memory; `closed` records whether `close` was called.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<Event>,
    pub closed: bool,
}

impl MemorySink {
    pub fn scalars(&self, tag: &str) -> Vec<(usize, f64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Scalar { tag: t, step, value, .. } if t == tag => Some((*step, *value)),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.events.push(Event::Scalar {
            tag: tag.to_string(),
            step,
            value,
            wall_time: wall_time(),
        });
        Ok(())
    }

    fn add_text(&mut self, tag: &str, text: &str, step: usize) -> Result<()> {
        self.events.push(Event::Text {
            tag: tag.to_string(),
            step,
            text: text.to_string(),
            wall_time: wall_time(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }

    fn add_text(&mut self, tag: &str, text: &str, step: usize) -> Result<()> {
        (**self).add_text(tag, text, step)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

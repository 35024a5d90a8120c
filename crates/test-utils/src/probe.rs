use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use modrun::resources::probe::SystemProbe;

/// A probe reporting whatever the test sets.
#[derive(Debug, Default)]
pub struct FixedProbe {
    cpu_percent: Mutex<Option<f32>>,
    available_memory_bytes: Mutex<Option<u64>>,
    samples: AtomicUsize,
}

impl FixedProbe {
    pub fn new(cpu_percent: Option<f32>, available_memory_mb: Option<u64>) -> Self {
        Self {
            cpu_percent: Mutex::new(cpu_percent),
            available_memory_bytes: Mutex::new(available_memory_mb.map(|mb| mb * 1024 * 1024)),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set_cpu_percent(&self, value: Option<f32>) {
        *self.cpu_percent.lock() = value;
    }

    pub fn set_available_memory_mb(&self, value: Option<u64>) {
        *self.available_memory_bytes.lock() = value.map(|mb| mb * 1024 * 1024);
    }

    /// How many times either metric was read.
    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemProbe for FixedProbe {
    async fn cpu_percent(&self, _window: Duration) -> Option<f32> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        *self.cpu_percent.lock()
    }

    async fn available_memory_bytes(&self) -> Option<u64> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        *self.available_memory_bytes.lock()
    }
}

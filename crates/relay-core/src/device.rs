//! Device registry: an immutable, ordered set of probed compute devices.

/// A probed compute device. Immutable once constructed; the registry
/// never mutates or removes entries after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    pub backend: String,
    pub vram_gb: f64,
    pub tflops: f64,
    pub bandwidth_gbps: f64,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        vram_gb: f64,
        tflops: f64,
        bandwidth_gbps: f64,
    ) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            vram_gb,
            tflops,
            bandwidth_gbps,
        }
    }

    /// Weighted combination of compute, bandwidth and memory used to
    /// rank devices against each other.
    pub fn strength_score(&self) -> f64 {
        self.tflops * 0.6 + self.bandwidth_gbps * 0.3 + self.vram_gb * 0.1
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.backend, self.name)
    }
}

/// Ordered sequence of devices, filled once at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_all(&mut self, devices: impl IntoIterator<Item = Device>) {
        self.devices.extend(devices);
    }

    /// Stable snapshot copy, in insertion order.
    pub fn list(&self) -> Vec<Device> {
        self.devices.clone()
    }

    /// Argmax of `strength_score`; first one wins on ties.
    pub fn best_device(&self) -> Option<Device> {
        self.devices
            .iter()
            .enumerate()
            .max_by(|(ai, a), (bi, b)| {
                a.strength_score()
                    .partial_cmp(&b.strength_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ai.cmp(bi).reverse())
            })
            .map(|(_, d)| d.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_best_device() {
        let registry = DeviceRegistry::new();
        assert!(registry.best_device().is_none());
    }

    #[test]
    fn best_device_is_strength_argmax_first_on_ties() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([
            Device::new("a", "cpu", 0.0, 1.0, 10.0),
            Device::new("b", "cuda", 12.0, 20.0, 300.0),
            Device::new("c", "cuda", 12.0, 20.0, 300.0),
        ]);
        let best = registry.best_device().unwrap();
        assert_eq!(best.name, "b");
    }

    #[test]
    fn list_is_a_stable_snapshot() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([Device::new("a", "cpu", 0.0, 1.0, 10.0)]);
        let snapshot = registry.list();
        registry.add_all([Device::new("b", "cuda", 1.0, 1.0, 1.0)]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}

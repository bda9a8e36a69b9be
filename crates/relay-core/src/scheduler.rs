//! Device selection and request-phase classification.

use crate::device::{Device, DeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDecision {
    pub device: Device,
    pub phase: Phase,
}

/// Picks a device for a prompt and classifies which inference phase it
/// falls into. The reference implementation always classifies as
/// `Prefill`; the hook exists so a future scheduler can distinguish
/// prefill-heavy from decode-heavy work.
pub struct Scheduler<'a> {
    registry: &'a DeviceRegistry,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a DeviceRegistry) -> Self {
        Self { registry }
    }

    pub fn classify(&self, _prompt: &str) -> Phase {
        Phase::Prefill
    }

    /// `None` when the registry is empty; the engine translates this
    /// into a user-visible "no devices available" reply.
    pub fn pick_device(&self, prompt: &str) -> Option<ScheduleDecision> {
        let device = self.registry.best_device()?;
        let phase = self.classify(prompt);
        Some(ScheduleDecision { device, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn classify_always_returns_prefill() {
        let registry = DeviceRegistry::new();
        let scheduler = Scheduler::new(&registry);
        assert_eq!(scheduler.classify("anything"), Phase::Prefill);
    }

    #[test]
    fn pick_device_is_none_on_empty_registry() {
        let registry = DeviceRegistry::new();
        let scheduler = Scheduler::new(&registry);
        assert!(scheduler.pick_device("hi").is_none());
    }

    #[test]
    fn pick_device_delegates_to_best_device() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([Device::new("cpu0", "cpu", 0.0, 1.0, 10.0)]);
        let scheduler = Scheduler::new(&registry);
        let decision = scheduler.pick_device("hi").unwrap();
        assert_eq!(decision.device.name, "cpu0");
        assert_eq!(decision.phase, Phase::Prefill);
    }
}

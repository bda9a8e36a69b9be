//! Trivial fallback invoked when the backend dispatcher has nothing to
//! say — whether because no backends are configured or because the
//! upstream call failed.

use crate::device::Device;

pub struct EchoRunner;

impl EchoRunner {
    pub fn new() -> Self {
        Self
    }

    /// Pure, total, side-effect-free.
    pub fn run(&self, _device: &Device, prompt: &str) -> String {
        format!("Echo: {prompt}")
    }
}

impl Default for EchoRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_with_prefix() {
        let runner = EchoRunner::new();
        let device = Device::new("cpu0", "cpu", 0.0, 1.0, 1.0);
        assert_eq!(runner.run(&device, "Hi"), "Echo: Hi");
    }
}

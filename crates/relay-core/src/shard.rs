//! Pure shard planning: divides a fixed layer count across devices
//! proportionally to strength while preserving the exact total.

use relay_common::{RelayError, Result};

use crate::device::Device;

/// Placement of model layers across the current device set. A pure
/// value, recomputed on demand from the frozen registry + settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardPlan {
    pub placements: Vec<String>,
    pub layer_ranges: Vec<(usize, usize)>,
}

pub struct ShardPlanner;

impl ShardPlanner {
    pub fn new() -> Self {
        Self
    }

    /// `total_layers <= 0` degrades to an empty `layer_ranges` with
    /// `placements` still enumerated. `devices.len() > total_layers`
    /// (with `total_layers > 0`) is a configuration error: the
    /// decrement-never-below-1 normalisation loop cannot converge, per
    /// the open question in the design notes.
    pub fn plan(&self, devices: &[Device], total_layers: i64) -> Result<ShardPlan> {
        let placements: Vec<String> = devices.iter().map(Device::label).collect();

        if devices.is_empty() || total_layers <= 0 {
            return Ok(ShardPlan {
                placements,
                layer_ranges: Vec::new(),
            });
        }

        let total_layers = total_layers as usize;
        if devices.len() > total_layers {
            return Err(RelayError::ShardConfig(format!(
                "{} devices cannot each receive at least one of {} layers",
                devices.len(),
                total_layers
            )));
        }

        let strengths: Vec<f64> = devices
            .iter()
            .map(|d| d.strength_score().max(0.1))
            .collect();
        let total_strength: f64 = strengths.iter().sum();

        let mut allocations: Vec<i64> = strengths
            .iter()
            .map(|s| {
                let share = (total_layers as f64) * (s / total_strength);
                (share.floor() as i64).max(1)
            })
            .collect();

        let sum = |v: &[i64]| v.iter().sum::<i64>();
        // `max_by_key` resolves ties to the last element; the spec requires
        // first occurrence, so fold explicitly instead.
        let argmax = |v: &[i64]| {
            v.iter()
                .enumerate()
                .fold(0usize, |best, (i, &val)| if val > v[best] { i } else { best })
        };

        while sum(&allocations) > total_layers as i64 {
            let idx = argmax(&allocations);
            allocations[idx] = (allocations[idx] - 1).max(1);
        }
        while sum(&allocations) < total_layers as i64 {
            let idx = argmax(&allocations);
            allocations[idx] += 1;
        }

        let mut layer_ranges = Vec::with_capacity(devices.len());
        let mut cursor = 0usize;
        for &alloc in &allocations {
            let start = cursor;
            let end = (total_layers - 1).min(start + alloc as usize - 1);
            layer_ranges.push((start, end));
            cursor = end + 1;
        }

        Ok(ShardPlan {
            placements,
            layer_ranges,
        })
    }
}

impl Default for ShardPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(name: &str, backend: &str, tflops: f64, bw: f64, vram: f64) -> Device {
        Device::new(name, backend, vram, tflops, bw)
    }

    #[test]
    fn empty_devices_yields_empty_everything() {
        let plan = ShardPlanner::new().plan(&[], 32).unwrap();
        assert!(plan.placements.is_empty());
        assert!(plan.layer_ranges.is_empty());
    }

    #[test]
    fn non_positive_total_layers_yields_empty_ranges_but_placements() {
        let devices = [dev("a", "cpu", 1.0, 10.0, 0.0)];
        let plan = ShardPlanner::new().plan(&devices, 0).unwrap();
        assert_eq!(plan.placements, vec!["cpu:a".to_string()]);
        assert!(plan.layer_ranges.is_empty());

        let plan = ShardPlanner::new().plan(&devices, -5).unwrap();
        assert!(plan.layer_ranges.is_empty());
    }

    #[test]
    fn fairness_example_from_spec() {
        // strength = 0.6*tflops + 0.3*bw + 0.1*vram; pick tflops so A:B = 9:1.
        let devices = [
            dev("A", "cuda", 15.0, 0.0, 0.0),       // strength 9.0
            dev("B", "cpu", 1.6666666667, 0.0, 0.0), // strength ~1.0
        ];
        let plan = ShardPlanner::new().plan(&devices, 10).unwrap();
        assert_eq!(plan.layer_ranges, vec![(0, 8), (9, 9)]);
    }

    #[test]
    fn coverage_and_contiguity_for_many_device_layer_combos() {
        for n_devices in 1..=6usize {
            for total in [n_devices as i64, 10, 32, 128] {
                let devices: Vec<Device> = (0..n_devices)
                    .map(|i| Device::new(format!("d{i}"), "cpu", i as f64, (i + 1) as f64, 1.0))
                    .collect();
                let plan = ShardPlanner::new().plan(&devices, total).unwrap();
                assert_eq!(plan.layer_ranges.len(), devices.len());
                let mut expect_start = 0usize;
                let mut covered = 0i64;
                for &(s, e) in &plan.layer_ranges {
                    assert_eq!(s, expect_start);
                    assert!(e >= s, "range must be non-empty");
                    covered += (e - s + 1) as i64;
                    expect_start = e + 1;
                }
                assert_eq!(covered, total);
            }
        }
    }

    #[test]
    fn too_many_devices_for_total_layers_is_a_config_error() {
        let devices = [
            Device::new("a", "cpu", 0.0, 1.0, 1.0),
            Device::new("b", "cpu", 0.0, 1.0, 1.0),
            Device::new("c", "cpu", 0.0, 1.0, 1.0),
        ];
        let err = ShardPlanner::new().plan(&devices, 2).unwrap_err();
        assert!(matches!(err, RelayError::ShardConfig(_)));
    }

    #[test]
    fn strictly_stronger_device_gets_at_least_as_many_layers() {
        let devices = [
            Device::new("strong", "cuda", 24.0, 50.0, 900.0),
            Device::new("weak", "cpu", 0.0, 1.0, 10.0),
        ];
        let plan = ShardPlanner::new().plan(&devices, 32).unwrap();
        let (s0, e0) = plan.layer_ranges[0];
        let (s1, e1) = plan.layer_ranges[1];
        assert!((e0 - s0 + 1) >= (e1 - s1 + 1));
    }

    #[test]
    fn normalisation_increment_breaks_ties_toward_first_occurrence() {
        // strengths 2.0 and 1.99 both floor to an allocation of 1 at
        // total_layers=3 (sum=2, one increment needed); the stronger
        // device (index 0) must receive it, not the weaker one.
        let devices = [
            Device::new("a", "cpu", 20.0, 0.0, 0.0),
            Device::new("b", "cpu", 19.9, 0.0, 0.0),
        ];
        let plan = ShardPlanner::new().plan(&devices, 3).unwrap();
        let (s0, e0) = plan.layer_ranges[0];
        let (s1, e1) = plan.layer_ranges[1];
        assert_eq!(e0 - s0 + 1, 2);
        assert_eq!(e1 - s1 + 1, 1);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RESOURCE_LIMITS QoS policy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_samples: i32,
    pub max_instances: i32,
    pub max_samples_per_instance: i32,
}

/// Sentinel for "unlimited" in any of the three fields, matching the DDS
/// spec's `LENGTH_UNLIMITED`.
pub const LENGTH_UNLIMITED: i32 = -1;

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_samples: LENGTH_UNLIMITED,
            max_instances: LENGTH_UNLIMITED,
            max_samples_per_instance: LENGTH_UNLIMITED,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_samples != LENGTH_UNLIMITED
            && self.max_instances != LENGTH_UNLIMITED
            && self.max_samples_per_instance != LENGTH_UNLIMITED
            && self.max_samples < self.max_instances * self.max_samples_per_instance
        {
            return Err(
                "max_samples must be >= max_instances * max_samples_per_instance".into(),
            );
        }
        Ok(())
    }
}

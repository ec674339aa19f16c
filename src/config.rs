use alloc::string::String;

/// Tunables for an [`IoManager`](crate::IoManager).
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Size of the dispatcher input buffer before any request forced a regrow.
    pub initial_in_size: usize,
    /// Stacks shallower than this (other than 1) get this many location slots.
    pub irp_bucket: u8,
    pub device_name_prefix: String,
    pub driver_name_prefix: String,
    pub service_registry_root: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            initial_in_size: 4096,
            irp_bucket: 8,
            device_name_prefix: String::from("\\Device\\"),
            driver_name_prefix: String::from("\\Driver\\"),
            service_registry_root: String::from(
                "\\Registry\\Machine\\System\\CurrentControlSet\\Services\\",
            ),
        }
    }
}

impl IoConfig {
    pub fn initial_in_size(mut self, size: usize) -> Self {
        self.initial_in_size = size.max(1);
        self
    }

    pub fn irp_bucket(mut self, slots: u8) -> Self {
        self.irp_bucket = slots.max(1);
        self
    }

    pub fn device_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_name_prefix = prefix.into();
        self
    }

    pub fn driver_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.driver_name_prefix = prefix.into();
        self
    }

    pub fn service_registry_root(mut self, root: impl Into<String>) -> Self {
        self.service_registry_root = root.into();
        self
    }

    #[inline]
    pub fn driver_name(&self, service: &str) -> String {
        let mut name = self.driver_name_prefix.clone();
        name.push_str(service);
        name
    }

    #[inline]
    pub fn registry_path(&self, service: &str) -> String {
        let mut path = self.service_registry_root.clone();
        path.push_str(service);
        path
    }

    /// Slot count actually reserved for a stack of `stack_size` layers.
    #[inline]
    pub fn slot_capacity(&self, stack_size: u8) -> u8 {
        if stack_size < self.irp_bucket && stack_size != 1 {
            self.irp_bucket
        } else {
            stack_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounding() {
        let cfg = IoConfig::default();
        assert_eq!(cfg.slot_capacity(0), 8);
        assert_eq!(cfg.slot_capacity(1), 1);
        assert_eq!(cfg.slot_capacity(3), 8);
        assert_eq!(cfg.slot_capacity(8), 8);
        assert_eq!(cfg.slot_capacity(12), 12);
    }

    #[test]
    fn names() {
        let cfg = IoConfig::default().driver_name_prefix("\\FileSystem\\");
        assert_eq!(cfg.driver_name("null"), "\\FileSystem\\null");
        assert!(cfg.registry_path("null").ends_with("\\Services\\null"));
    }
}

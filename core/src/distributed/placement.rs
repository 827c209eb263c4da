use crate::error::{config_err, Result};

/// Compute devices available to this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    devices: usize,
}

impl Topology {
    pub fn new(devices: usize) -> Self {
        Self { devices }
    }

    /// One device per hardware thread.
    pub fn detect() -> Self {
        let devices = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { devices }
    }

    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Fails when more towers are requested than devices exist.
    pub fn check(&self, requested: usize) -> Result<()> {
        if requested > self.devices {
            return config_err!(
                "{requested} devices requested but only {} available",
                self.devices
            );
        }
        Ok(())
    }
}

/// Where parameters are stored and where each tower computes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub param_device: String,
}

impl Placement {
    pub fn new(param_device: impl Into<String>) -> Self {
        Self {
            param_device: param_device.into(),
        }
    }

    /// Name of the compute device for tower `index`.
    pub fn compute_device(&self, index: usize) -> String {
        format!("/gpu:{index}")
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::new("/gpu:0")
    }
}

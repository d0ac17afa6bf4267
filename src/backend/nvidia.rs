use crate::backend::EnergyBackend;
use crate::error::{Error, Result};
use nvml_wrapper::Nvml;
use nvml_wrapper::error::NvmlError;

/// NVIDIA devices sampled through NVML. The driver reports instantaneous
/// power, so per-device energy is integrated over tick deltas rather than read
/// from a hardware counter.
pub struct NvidiaBackend {
    nvml: Nvml,
    /// NVML indices of devices whose power readout probed as supported.
    devices: Vec<u32>,
    /// Accumulated joules per device since the last reset.
    energy: Vec<f64>,
    columns: Vec<String>,
}

impl NvidiaBackend {
    /// Enumerate NVIDIA devices. A missing library or driver means the
    /// backend is absent (`Ok(None)`); failures after a successful init are
    /// fatal. A device that does not support power readout is skipped.
    pub fn probe() -> Result<Option<Self>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => return Ok(None),
        };

        let count = nvml
            .device_count()
            .map_err(|e| Error::Gpu(format!("failed to query device count: {e}")))?;

        let mut devices = Vec::new();
        let mut columns = Vec::new();
        for index in 0..count {
            let device = nvml
                .device_by_index(index)
                .map_err(|e| Error::Gpu(format!("failed to get handle for device {index}: {e}")))?;
            match device.power_usage() {
                Ok(_) => {
                    devices.push(index);
                    columns.push(format!("nvd_{}", index));
                }
                Err(NvmlError::NotSupported) => continue,
                Err(e) => {
                    return Err(Error::Gpu(format!(
                        "failed to probe power readout on device {index}: {e}"
                    )));
                }
            }
        }

        let energy = vec![0.0; devices.len()];
        Ok(Some(Self {
            nvml,
            devices,
            energy,
            columns,
        }))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

impl EnergyBackend for NvidiaBackend {
    fn name(&self) -> &'static str {
        "nvidia"
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn reset(&mut self) -> Result<()> {
        self.energy.fill(0.0);
        Ok(())
    }

    fn sample(&mut self, elapsed: f64, row: &mut Vec<f64>) -> Result<()> {
        for (slot, &index) in self.devices.iter().enumerate() {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| Error::Gpu(format!("lost handle for device {index}: {e}")))?;
            let milliwatts = device
                .power_usage()
                .map_err(|e| Error::Gpu(format!("power readout failed on device {index}: {e}")))?;
            let watts = milliwatts as f64 / 1000.0;
            self.energy[slot] += watts * elapsed;
            row.push(watts);
        }
        Ok(())
    }

    fn totals(&mut self, out: &mut Vec<f64>) -> Result<()> {
        out.extend_from_slice(&self.energy);
        Ok(())
    }

    fn close(&mut self) {
        // NVML itself shuts down when the handle drops; forgetting the device
        // list keeps any late caller from touching it.
        self.devices.clear();
        self.energy.clear();
    }
}

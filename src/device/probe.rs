//! Probe / attach callbacks
//!
//! Whatever enumerates controllers (a PCIe scan, a fabric discovery
//! service, a test harness) offers each one to [`DeviceProbe::probe`] and,
//! if accepted, hands the opened namespace to [`DeviceProbe::attach`].

use std::sync::Arc;

use crate::error::{NvlogError, Result};

use super::BlockDevice;

/// Identity of a discovered controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    /// Transport address (PCI BDF, fabric address, file path)
    pub transport_addr: String,
    /// Model string reported by the controller
    pub model: String,
}

/// Accepts at most one controller and keeps its namespace
pub struct DeviceProbe {
    filter: Option<String>,
    attached: Option<(ControllerInfo, Arc<dyn BlockDevice>)>,
}

impl DeviceProbe {
    pub fn new(filter: Option<String>) -> Self {
        Self {
            filter,
            attached: None,
        }
    }

    /// Probe callback: accept the controller?
    pub fn probe(&self, info: &ControllerInfo) -> bool {
        if self.attached.is_some() {
            tracing::debug!("Skipping {}: a device is already attached", info.transport_addr);
            return false;
        }
        let accept = match &self.filter {
            Some(addr) => *addr == info.transport_addr,
            None => true,
        };
        tracing::debug!(
            "Probe {} ({}): {}",
            info.transport_addr,
            info.model,
            if accept { "accepted" } else { "rejected" }
        );
        accept
    }

    /// Attach callback: keep the opened namespace and its geometry
    pub fn attach(&mut self, info: ControllerInfo, device: Arc<dyn BlockDevice>) {
        let geometry = device.geometry();
        tracing::info!(
            "Attached {} ({}): sector_size={} max_sectors_per_io={} capacity={} sectors",
            info.transport_addr,
            info.model,
            geometry.sector_size,
            geometry.max_sectors_per_io,
            geometry.capacity_sectors
        );
        self.attached = Some((info, device));
    }

    /// Drive probe/attach over a list of discovered controllers
    pub fn run<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = (ControllerInfo, Arc<dyn BlockDevice>)>,
    {
        for (info, device) in candidates {
            if self.probe(&info) {
                self.attach(info, device);
            }
        }
    }

    /// Controller that was attached, if any
    pub fn attached(&self) -> Option<&ControllerInfo> {
        self.attached.as_ref().map(|(info, _)| info)
    }

    /// Take the attached namespace
    pub fn into_device(self) -> Result<Arc<dyn BlockDevice>> {
        self.attached
            .map(|(_, device)| device)
            .ok_or(NvlogError::NoDevice)
    }
}

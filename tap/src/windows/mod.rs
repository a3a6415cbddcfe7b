//! Driver-handle backend for TAP-Windows adapters.

mod device;
mod iface;
mod overlapped;
mod registry;

use crate::config::TapConfig;
use crate::driver::{self, DriverOpener, DriverTap, COMPONENT_ID};
use crate::error::Result;
use crate::tap_impl::DeviceInfo;

pub(crate) use device::WindowsTap;
pub(crate) use registry::RegKey;

struct DeviceOpener;

impl DriverOpener for DeviceOpener {
    type Device = WindowsTap;

    fn open(&self, instance_id: &str) -> Result<WindowsTap> {
        WindowsTap::open(&driver::device_path(instance_id))
    }
}

pub(crate) fn open(config: &TapConfig) -> Result<(DriverTap<WindowsTap, RegKey>, DeviceInfo)> {
    if let Some(name) = &config.name {
        log::debug!("tap: ignoring name hint {:?}, the installed adapter decides", name);
    }

    let registry = registry::NetworkClass::open(config.apply_mtu)?;
    let requested_mtu = config.apply_mtu.then_some(config.mtu);

    driver::open_driver_adapter(
        &registry,
        &DeviceOpener,
        &iface::SystemInterfaces,
        COMPONENT_ID,
        requested_mtu,
    )
}

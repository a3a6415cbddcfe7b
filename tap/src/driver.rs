//! Discovery and lifetime of driver-handle adapters.
//!
//! A driver-handle adapter is pre-installed by the OS driver framework. It is
//! found by walking the network-class configuration tree for an entry whose
//! component id names the tap driver, opened by the instance id stored in
//! that entry, and then named by matching the hardware address the driver
//! reports against the OS interface table.
//!
//! The walk is written against the traits below so the same code runs over
//! the Windows registry and over in-memory fixtures.

use crate::error::{Result, TapError};
use crate::mac::MacAddr;
use crate::tap_impl::{DeviceInfo, ReadErrorPolicy, TapImpl};
use std::io;
use std::sync::Mutex;

/// Component id of the TAP-Windows NDIS 6 driver.
pub const COMPONENT_ID: &str = "tap0901";

pub const COMPONENT_ID_VALUE: &str = "ComponentId";
pub const INSTANCE_ID_VALUE: &str = "NetCfgInstanceId";
pub const MTU_VALUE: &str = "MTU";

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

pub const TAP_IOCTL_GET_MAC: u32 = ctl_code(FILE_DEVICE_UNKNOWN, 1, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const TAP_IOCTL_SET_MEDIA_STATUS: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 6, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Device path of the driver instance with the given `NetCfgInstanceId`.
pub fn device_path(instance_id: &str) -> String {
    format!(r"\\.\Global\{}.tap", instance_id)
}

pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// One opened entry of the configuration tree. Dropping it releases it.
pub trait RegistryKey: Send {
    fn string_value(&self, name: &str) -> io::Result<String>;
    fn set_string_value(&self, name: &str, value: &str) -> io::Result<()>;
}

/// The network-class configuration tree, one subkey per installed device.
pub trait AdapterRegistry {
    type Key: RegistryKey;

    fn subkeys(&self) -> io::Result<Vec<String>>;
    fn open_subkey(&self, name: &str) -> io::Result<Self::Key>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
}

/// OS-visible network interfaces.
pub trait InterfaceTable {
    fn interfaces(&self) -> io::Result<Vec<InterfaceEntry>>;
}

/// An open driver handle.
pub trait DriverDevice: TapImpl {
    /// Asks the driver itself for the adapter's hardware address.
    fn hardware_address(&self) -> io::Result<MacAddr>;
}

/// Opens the device node belonging to an instance id.
pub trait DriverOpener {
    type Device: DriverDevice + 'static;

    fn open(&self, instance_id: &str) -> Result<Self::Device>;
}

/// Returns the first configuration entry whose component id matches, along
/// with its instance id. Entries that cannot be opened or carry no component
/// id are skipped.
pub fn find_adapter_key<R: AdapterRegistry>(
    registry: &R,
    component_id: &str,
) -> Result<(R::Key, String)> {
    let subkeys = registry
        .subkeys()
        .map_err(|e| TapError::Registry(format!("enumerating adapters: {}", e)))?;

    for name in subkeys {
        let key = match registry.open_subkey(&name) {
            Ok(key) => key,
            Err(e) => {
                log::trace!("tap: skipping adapter entry {}: {}", name, e);
                continue;
            }
        };

        match key.string_value(COMPONENT_ID_VALUE) {
            Ok(id) if id.eq_ignore_ascii_case(component_id) => {}
            _ => continue,
        }

        let instance_id = key.string_value(INSTANCE_ID_VALUE).map_err(|e| {
            TapError::Registry(format!("reading {} of entry {}: {}", INSTANCE_ID_VALUE, name, e))
        })?;

        log::debug!("tap: found {} adapter {} at entry {}", component_id, instance_id, name);
        return Ok((key, instance_id));
    }

    Err(TapError::AdapterNotFound)
}

/// Finds the interface whose hardware address is `mac`.
pub fn interface_by_mac<T: InterfaceTable>(table: &T, mac: MacAddr) -> Result<InterfaceEntry> {
    table
        .interfaces()?
        .into_iter()
        .find(|iface| iface.mac == Some(mac))
        .ok_or(TapError::InterfaceNameNotFound(mac))
}

/// A driver handle together with the configuration entry it was found
/// through.
///
/// Closing releases the handle, puts back an MTU that was overridden at
/// open time and releases the configuration entry.
pub struct DriverTap<D, K> {
    device: D,
    key: Mutex<Option<KeyGuard<K>>>,
}

struct KeyGuard<K> {
    key: K,
    original_mtu: Option<String>,
}

impl<K: RegistryKey> KeyGuard<K> {
    fn restore(self) -> io::Result<()> {
        match &self.original_mtu {
            Some(mtu) => self.key.set_string_value(MTU_VALUE, mtu),
            None => Ok(()),
        }
    }
}

impl<D: DriverDevice, K: RegistryKey> TapImpl for DriverTap<D, K> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.device.write(buf)
    }

    fn set_link_state(&self, connected: bool) -> io::Result<()> {
        self.device.set_link_state(connected)
    }

    fn close(&self) -> io::Result<()> {
        let closed = self.device.close();

        let guard = self
            .key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let restored = match guard {
            Some(guard) => guard.restore(),
            None => Ok(()),
        };

        closed.and(restored)
    }

    fn read_error_policy(&self) -> ReadErrorPolicy {
        self.device.read_error_policy()
    }
}

/// Runs the full discovery walk and returns the open adapter with its
/// identity.
///
/// With `requested_mtu` set, the entry's `MTU` value is overwritten and the
/// previous value, if there was one, is put back on close. On any failure
/// after the entry has been found, the handle is closed and the entry
/// released before the error is returned.
pub fn open_driver_adapter<R, O, T>(
    registry: &R,
    opener: &O,
    table: &T,
    component_id: &str,
    requested_mtu: Option<u32>,
) -> Result<(DriverTap<O::Device, R::Key>, DeviceInfo)>
where
    R: AdapterRegistry,
    R::Key: 'static,
    O: DriverOpener,
    T: InterfaceTable,
{
    let (key, instance_id) = find_adapter_key(registry, component_id)?;
    let mut guard = KeyGuard {
        key,
        original_mtu: None,
    };

    if let Some(mtu) = requested_mtu {
        let original = guard.key.string_value(MTU_VALUE).ok();
        guard
            .key
            .set_string_value(MTU_VALUE, &mtu.to_string())
            .map_err(|e| TapError::Registry(format!("writing {}: {}", MTU_VALUE, e)))?;
        guard.original_mtu = original;
    }

    let device = match opener.open(&instance_id) {
        Ok(device) => device,
        Err(e) => {
            release(guard);
            return Err(e);
        }
    };

    let tap = DriverTap {
        device,
        key: Mutex::new(Some(guard)),
    };

    match identify(&tap.device, table) {
        Ok(info) => {
            log::info!(
                "tap: opened adapter {} ({}, mtu {})",
                info.name,
                info.mac,
                info.mtu
            );
            Ok((tap, info))
        }
        Err(e) => {
            if let Err(close_err) = tap.close() {
                log::warn!("tap: cleanup after failed open: {}", close_err);
            }
            Err(e)
        }
    }
}

fn identify<D: DriverDevice, T: InterfaceTable>(device: &D, table: &T) -> Result<DeviceInfo> {
    device.set_link_state(true)?;

    let mac = device
        .hardware_address()
        .map_err(TapError::HardwareAddress)?;

    let iface = interface_by_mac(table, mac)?;

    Ok(DeviceInfo {
        name: iface.name,
        mac,
        mtu: iface.mtu,
    })
}

fn release<K: RegistryKey>(guard: KeyGuard<K>) {
    if let Err(e) = guard.restore() {
        log::warn!("tap: restoring {}: {}", MTU_VALUE, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Key(HashMap<&'static str, String>);

    impl RegistryKey for Key {
        fn string_value(&self, name: &str) -> io::Result<String> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn set_string_value(&self, _name: &str, _value: &str) -> io::Result<()> {
            Ok(())
        }
    }

    struct Tree(Vec<(&'static str, Option<&'static str>, &'static str)>);

    impl AdapterRegistry for Tree {
        type Key = Key;

        fn subkeys(&self) -> io::Result<Vec<String>> {
            Ok(self.0.iter().map(|(n, _, _)| n.to_string()).collect())
        }

        fn open_subkey(&self, name: &str) -> io::Result<Key> {
            let (_, component, instance) = self
                .0
                .iter()
                .find(|(n, _, _)| *n == name)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            let mut values = HashMap::new();
            if let Some(component) = component {
                values.insert(COMPONENT_ID_VALUE, component.to_string());
            }
            values.insert(INSTANCE_ID_VALUE, instance.to_string());
            Ok(Key(values))
        }
    }

    #[test]
    fn control_codes() {
        assert_eq!(TAP_IOCTL_GET_MAC, 0x0022_0004);
        assert_eq!(TAP_IOCTL_SET_MEDIA_STATUS, 0x0022_0018);
    }

    #[test]
    fn device_path_uses_global_namespace() {
        assert_eq!(
            device_path("{1234-ABCD}"),
            r"\\.\Global\{1234-ABCD}.tap"
        );
    }

    #[test]
    fn entries_without_component_id_are_skipped() {
        let tree = Tree(vec![
            ("0000", None, "{A}"),
            ("0001", Some("TAP0901"), "{B}"),
        ]);
        let (_, id) = find_adapter_key(&tree, COMPONENT_ID).unwrap();
        assert_eq!(id, "{B}");
    }

    #[test]
    fn interface_lookup_ignores_entries_without_address() {
        struct Table;
        impl InterfaceTable for Table {
            fn interfaces(&self) -> io::Result<Vec<InterfaceEntry>> {
                Ok(vec![
                    InterfaceEntry {
                        name: "Loopback".into(),
                        mac: None,
                        mtu: 65536,
                    },
                    InterfaceEntry {
                        name: "Ethernet 2".into(),
                        mac: Some(MacAddr::new([0, 0xff, 1, 2, 3, 4])),
                        mtu: 1500,
                    },
                ])
            }
        }

        let found = interface_by_mac(&Table, MacAddr::new([0, 0xff, 1, 2, 3, 4])).unwrap();
        assert_eq!(found.name, "Ethernet 2");

        let missing = interface_by_mac(&Table, MacAddr::new([9; 6])).unwrap_err();
        assert!(matches!(missing, TapError::InterfaceNameNotFound(_)));
    }
}

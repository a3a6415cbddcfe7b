use crate::driver::{InterfaceEntry, InterfaceTable};
use crate::mac::MacAddr;
use std::io;
use windows::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, ERROR_SUCCESS};
use windows::Win32::NetworkManagement::IpHelper::{
    GetAdaptersAddresses, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER, GAA_FLAG_SKIP_MULTICAST,
    IP_ADAPTER_ADDRESSES_LH,
};
use windows::Win32::Networking::WinSock::AF_UNSPEC;

/// Interfaces as reported by `GetAdaptersAddresses`.
pub(super) struct SystemInterfaces;

impl InterfaceTable for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceEntry>> {
        let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
        let mut size = 16 * 1024u32;

        // The table can grow between the sizing call and the real one.
        let buffer = loop {
            // u64 storage keeps the entries suitably aligned.
            let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
            let ret = unsafe {
                GetAdaptersAddresses(
                    AF_UNSPEC.0 as u32,
                    flags,
                    None,
                    Some(buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH),
                    &mut size,
                )
            };
            match ret {
                r if r == ERROR_SUCCESS.0 => break buffer,
                r if r == ERROR_BUFFER_OVERFLOW.0 => continue,
                r => return Err(io::Error::from_raw_os_error(r as i32)),
            }
        };

        let mut entries = Vec::new();
        let mut current = buffer.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
        while !current.is_null() {
            let adapter = unsafe { &*current };

            let name = if adapter.FriendlyName.is_null() {
                String::new()
            } else {
                unsafe { adapter.FriendlyName.to_string() }.unwrap_or_default()
            };

            let len = adapter.PhysicalAddressLength as usize;
            let mac = if len == 6 {
                MacAddr::from_slice(&adapter.PhysicalAddress[..len])
            } else {
                None
            };

            entries.push(InterfaceEntry {
                name,
                mac,
                mtu: adapter.Mtu,
            });
            current = adapter.Next;
        }

        Ok(entries)
    }
}

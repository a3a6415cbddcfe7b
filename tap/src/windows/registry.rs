use crate::driver::{AdapterRegistry, RegistryKey};
use crate::error::{Result, TapError};
use std::io;
use windows::core::{HSTRING, PWSTR};
use windows::Win32::Foundation::{ERROR_NO_MORE_ITEMS, ERROR_SUCCESS, WIN32_ERROR};
use windows::Win32::System::Registry::{
    RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW, HKEY,
    HKEY_LOCAL_MACHINE, KEY_READ, KEY_SET_VALUE, REG_EXPAND_SZ, REG_SAM_FLAGS, REG_SZ,
    REG_VALUE_TYPE,
};

/// Network adapter device class.
const NETWORK_CLASS: &str =
    r"SYSTEM\CurrentControlSet\Control\Class\{4D36E972-E325-11CE-BFC1-08002BE10318}";

fn win32(err: WIN32_ERROR) -> io::Result<()> {
    if err == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err.0 as i32))
    }
}

/// An open registry key, closed on drop.
pub(crate) struct RegKey(HKEY);

// Registry handles are not tied to the opening thread.
unsafe impl Send for RegKey {}

impl RegKey {
    fn open(parent: HKEY, path: &str, access: REG_SAM_FLAGS) -> io::Result<Self> {
        let mut key = HKEY::default();
        win32(unsafe { RegOpenKeyExW(parent, &HSTRING::from(path), 0, access, &mut key) })?;
        Ok(Self(key))
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        let _ = unsafe { RegCloseKey(self.0) };
    }
}

impl RegistryKey for RegKey {
    fn string_value(&self, name: &str) -> io::Result<String> {
        let name = HSTRING::from(name);
        let mut kind = REG_VALUE_TYPE::default();
        let mut size = 0u32;

        win32(unsafe { RegQueryValueExW(self.0, &name, None, Some(&mut kind), None, Some(&mut size)) })?;
        if kind != REG_SZ && kind != REG_EXPAND_SZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a string value", name),
            ));
        }

        let mut data = vec![0u16; (size as usize).div_ceil(2)];
        win32(unsafe {
            RegQueryValueExW(
                self.0,
                &name,
                None,
                None,
                Some(data.as_mut_ptr() as *mut u8),
                Some(&mut size),
            )
        })?;

        let len = data.iter().position(|&c| c == 0).unwrap_or(data.len());
        Ok(String::from_utf16_lossy(&data[..len]))
    }

    fn set_string_value(&self, name: &str, value: &str) -> io::Result<()> {
        let bytes: Vec<u8> = value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect();
        win32(unsafe { RegSetValueExW(self.0, &HSTRING::from(name), 0, REG_SZ, Some(&bytes)) })
    }
}

/// The installed network adapters under `HKLM`.
pub(crate) struct NetworkClass {
    root: RegKey,
    access: REG_SAM_FLAGS,
}

impl NetworkClass {
    /// Opens the class key. `writable` asks for permission to change adapter
    /// values, which needs administrator rights.
    pub(crate) fn open(writable: bool) -> Result<Self> {
        let access = if writable {
            KEY_READ | KEY_SET_VALUE
        } else {
            KEY_READ
        };
        let root = RegKey::open(HKEY_LOCAL_MACHINE, NETWORK_CLASS, KEY_READ)
            .map_err(|e| TapError::Registry(format!("opening {}: {}", NETWORK_CLASS, e)))?;
        Ok(Self { root, access })
    }
}

impl AdapterRegistry for NetworkClass {
    type Key = RegKey;

    fn subkeys(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut buf = [0u16; 256];

        for index in 0.. {
            let mut len = buf.len() as u32;
            let err = unsafe {
                RegEnumKeyExW(
                    self.root.0,
                    index,
                    PWSTR(buf.as_mut_ptr()),
                    &mut len,
                    None,
                    PWSTR::null(),
                    None,
                    None,
                )
            };
            if err == ERROR_NO_MORE_ITEMS {
                break;
            }
            win32(err)?;
            names.push(String::from_utf16_lossy(&buf[..len as usize]));
        }

        Ok(names)
    }

    fn open_subkey(&self, name: &str) -> io::Result<RegKey> {
        RegKey::open(self.root.0, name, self.access)
    }
}

//! Raw kernel key-management syscalls.
//!
//! Thin wrappers around `add_key(2)` and `keyctl(2)`; key-type specific
//! payload construction lives with the callers.

use std::ffi::CString;

use anyhow::{Context, Error};

/// Kernel key serial number.
pub type KeySerial = i32;

/// Special keyring ids understood by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyring {
    Thread,
    Process,
    Session,
    UserSession,
}

impl Keyring {
    fn id(self) -> libc::c_long {
        match self {
            Keyring::Thread => -1,
            Keyring::Process => -2,
            Keyring::Session => -3,
            Keyring::UserSession => -5,
        }
    }
}

const KEYCTL_UNLINK: libc::c_long = 9;
const KEYCTL_SEARCH: libc::c_long = 10;
const KEYCTL_INVALIDATE: libc::c_long = 21;

fn cstr(value: &str, what: &str) -> Result<CString, Error> {
    CString::new(value).context(format!("{what} contains a NUL byte"))
}

/// Inserts a key and links it into `keyring`. Returns the key serial.
pub fn add_key(
    key_type: &str,
    description: &str,
    payload: &[u8],
    keyring: Keyring,
) -> Result<KeySerial, Error> {
    let key_type_c = cstr(key_type, "key type")?;
    let description_c = cstr(description, "key description")?;

    let serial = unsafe {
        libc::syscall(
            libc::SYS_add_key,
            key_type_c.as_ptr(),
            description_c.as_ptr(),
            payload.as_ptr() as *const libc::c_void,
            payload.len(),
            keyring.id(),
        )
    };
    if serial < 0 {
        return Err(Error::new(std::io::Error::last_os_error())
            .context(format!("add_key failed for '{key_type}:{description}'")));
    }
    Ok(serial as KeySerial)
}

/// Finds a key by type and description in `keyring`.
pub fn search(key_type: &str, description: &str, keyring: Keyring) -> Result<KeySerial, Error> {
    let key_type_c = cstr(key_type, "key type")?;
    let description_c = cstr(description, "key description")?;

    let serial = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_SEARCH,
            keyring.id(),
            key_type_c.as_ptr(),
            description_c.as_ptr(),
            0 as libc::c_long,
        )
    };
    if serial < 0 {
        return Err(Error::new(std::io::Error::last_os_error())
            .context(format!("keyctl_search failed for '{key_type}:{description}'")));
    }
    Ok(serial as KeySerial)
}

/// Invalidates a key: it becomes unfindable immediately and is garbage
/// collected by the kernel.
pub fn invalidate(serial: KeySerial) -> Result<(), Error> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_INVALIDATE,
            serial as libc::c_long,
        )
    };
    if ret != 0 {
        return Err(Error::new(std::io::Error::last_os_error())
            .context(format!("keyctl_invalidate failed for key {serial}")));
    }
    Ok(())
}

/// Unlinks a key from `keyring`.
pub fn unlink(serial: KeySerial, keyring: Keyring) -> Result<(), Error> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_UNLINK,
            serial as libc::c_long,
            keyring.id(),
        )
    };
    if ret != 0 {
        return Err(Error::new(std::io::Error::last_os_error())
            .context(format!("keyctl_unlink failed for key {serial}")));
    }
    Ok(())
}

/// Searches for the key and invalidates it if present.
pub fn search_and_invalidate(
    key_type: &str,
    description: &str,
    keyring: Keyring,
) -> Result<(), Error> {
    let serial = search(key_type, description, keyring)?;
    invalidate(serial)
}

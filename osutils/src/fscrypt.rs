//! fscrypt policy and key management ioctls.
//!
//! Covers both the v1 (descriptor addressed) and v2 (filesystem keyring)
//! interfaces. Policies are applied to directories; v2 keys are installed
//! into the filesystem-level keyring of the mount that holds the directory.

use std::{fs::File, mem, os::fd::AsRawFd, path::Path};

use anyhow::{bail, Context, Error};
use nix::{request_code_read, request_code_readwrite};

pub const POLICY_V1: u8 = 0;
pub const POLICY_V2: u8 = 2;

pub const KEY_DESCRIPTOR_SIZE: usize = 8;
pub const KEY_IDENTIFIER_SIZE: usize = 16;

const MODE_AES_256_XTS: u8 = 1;
const MODE_AES_256_CTS: u8 = 4;
const POLICY_FLAGS_PAD_16: u8 = 0x02;

const KEY_SPEC_TYPE_IDENTIFIER: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PolicyV1 {
    version: u8,
    contents_encryption_mode: u8,
    filenames_encryption_mode: u8,
    flags: u8,
    master_key_descriptor: [u8; KEY_DESCRIPTOR_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PolicyV2 {
    version: u8,
    contents_encryption_mode: u8,
    filenames_encryption_mode: u8,
    flags: u8,
    reserved: [u8; 4],
    master_key_identifier: [u8; KEY_IDENTIFIER_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy)]
union PolicyUnion {
    version: u8,
    v1: PolicyV1,
    v2: PolicyV2,
}

#[repr(C)]
struct GetPolicyExArg {
    policy_size: u64,
    policy: PolicyUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct KeySpecifier {
    spec_type: u32,
    reserved: u32,
    // Big enough for both the v1 descriptor and the v2 identifier.
    u: [u8; 32],
}

#[repr(C)]
struct AddKeyArg {
    key_spec: KeySpecifier,
    raw_size: u32,
    key_id: u32,
    reserved: [u32; 8],
    // __u8 raw[] follows.
}

#[repr(C)]
struct RemoveKeyArg {
    key_spec: KeySpecifier,
    removal_status_flags: u32,
    reserved: [u32; 5],
}

fn ioctl(file: &File, request: libc::c_ulong, arg: *mut libc::c_void) -> std::io::Result<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request, arg) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn set_policy_request() -> libc::c_ulong {
    // Historical direction bits; the kernel consumes the struct.
    request_code_read!(b'f', 19, mem::size_of::<PolicyV1>()) as libc::c_ulong
}

fn get_policy_ex_request() -> libc::c_ulong {
    // Defined over __u8[9]: the size field plus the version byte.
    request_code_readwrite!(b'f', 22, 9) as libc::c_ulong
}

fn add_key_request() -> libc::c_ulong {
    request_code_readwrite!(b'f', 23, mem::size_of::<AddKeyArg>()) as libc::c_ulong
}

fn remove_key_request() -> libc::c_ulong {
    request_code_readwrite!(b'f', 24, mem::size_of::<RemoveKeyArg>()) as libc::c_ulong
}

/// Key state of a directory that may carry an fscrypt policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No policy is attached.
    NoKey,
    /// A policy is attached and readable.
    Encrypted,
    /// The filesystem does not support fscrypt.
    NotSupported,
    /// The directory claims encryption but its state is unreadable.
    Unknown,
}

/// Probes the fscrypt key state of `dir`.
pub fn get_key_state(dir: impl AsRef<Path>) -> Result<KeyState, Error> {
    let file = match File::open(dir.as_ref()) {
        Ok(file) => file,
        Err(_) => return Ok(KeyState::Unknown),
    };

    let mut arg = GetPolicyExArg {
        policy_size: mem::size_of::<PolicyUnion>() as u64,
        policy: PolicyUnion { version: 0 },
    };
    match ioctl(
        &file,
        get_policy_ex_request(),
        &mut arg as *mut _ as *mut libc::c_void,
    ) {
        Ok(()) => Ok(KeyState::Encrypted),
        Err(err) => match err.raw_os_error() {
            Some(libc::ENODATA) => Ok(KeyState::NoKey),
            Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) => Ok(KeyState::NotSupported),
            _ => Ok(KeyState::Unknown),
        },
    }
}

/// Attaches a v1 policy addressed by an 8-byte key descriptor.
pub fn set_policy_v1(dir: impl AsRef<Path>, descriptor: &[u8]) -> Result<(), Error> {
    if descriptor.len() != KEY_DESCRIPTOR_SIZE {
        bail!(
            "fscrypt v1 key descriptor must be {KEY_DESCRIPTOR_SIZE} bytes, got {}",
            descriptor.len()
        );
    }
    let file = open_dir(dir.as_ref())?;

    let mut policy = PolicyV1 {
        version: POLICY_V1,
        contents_encryption_mode: MODE_AES_256_XTS,
        filenames_encryption_mode: MODE_AES_256_CTS,
        flags: POLICY_FLAGS_PAD_16,
        master_key_descriptor: [0; KEY_DESCRIPTOR_SIZE],
    };
    policy.master_key_descriptor.copy_from_slice(descriptor);

    ioctl(
        &file,
        set_policy_request(),
        &mut policy as *mut _ as *mut libc::c_void,
    )
    .context(format!(
        "Failed to set fscrypt v1 policy on '{}'",
        dir.as_ref().display()
    ))
}

/// Attaches a v2 policy addressed by a 16-byte key identifier.
pub fn set_policy_v2(dir: impl AsRef<Path>, identifier: &[u8]) -> Result<(), Error> {
    if identifier.len() != KEY_IDENTIFIER_SIZE {
        bail!(
            "fscrypt v2 key identifier must be {KEY_IDENTIFIER_SIZE} bytes, got {}",
            identifier.len()
        );
    }
    let file = open_dir(dir.as_ref())?;

    let mut policy = PolicyV2 {
        version: POLICY_V2,
        contents_encryption_mode: MODE_AES_256_XTS,
        filenames_encryption_mode: MODE_AES_256_CTS,
        flags: POLICY_FLAGS_PAD_16,
        reserved: [0; 4],
        master_key_identifier: [0; KEY_IDENTIFIER_SIZE],
    };
    policy.master_key_identifier.copy_from_slice(identifier);

    ioctl(
        &file,
        set_policy_request(),
        &mut policy as *mut _ as *mut libc::c_void,
    )
    .context(format!(
        "Failed to set fscrypt v2 policy on '{}'",
        dir.as_ref().display()
    ))
}

/// Installs a raw key into the filesystem keyring of the mount holding
/// `mount_dir`. Returns the key identifier chosen by the kernel.
pub fn add_key_v2(
    mount_dir: impl AsRef<Path>,
    raw_key: &[u8],
) -> Result<[u8; KEY_IDENTIFIER_SIZE], Error> {
    let file = open_dir(mount_dir.as_ref())?;

    // The argument carries the raw key as a flexible array member.
    let arg_size = mem::size_of::<AddKeyArg>() + raw_key.len();
    let mut buffer = vec![0u8; arg_size];
    {
        let arg = buffer.as_mut_ptr() as *mut AddKeyArg;
        unsafe {
            (*arg).key_spec.spec_type = KEY_SPEC_TYPE_IDENTIFIER;
            (*arg).raw_size = raw_key.len() as u32;
        }
        buffer[mem::size_of::<AddKeyArg>()..].copy_from_slice(raw_key);
    }

    ioctl(
        &file,
        add_key_request(),
        buffer.as_mut_ptr() as *mut libc::c_void,
    )
    .context(format!(
        "FS_IOC_ADD_ENCRYPTION_KEY failed on '{}'",
        mount_dir.as_ref().display()
    ))?;

    let arg = buffer.as_ptr() as *const AddKeyArg;
    let mut identifier = [0u8; KEY_IDENTIFIER_SIZE];
    identifier.copy_from_slice(unsafe { &(&(*arg).key_spec.u)[..KEY_IDENTIFIER_SIZE] });

    // Scrub the raw key copy before the buffer is freed.
    for byte in buffer[mem::size_of::<AddKeyArg>()..].iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    Ok(identifier)
}

/// Removes a v2 key from the filesystem keyring of the mount holding
/// `mount_dir`.
pub fn remove_key_v2(mount_dir: impl AsRef<Path>, identifier: &[u8]) -> Result<(), Error> {
    if identifier.len() != KEY_IDENTIFIER_SIZE {
        bail!(
            "fscrypt v2 key identifier must be {KEY_IDENTIFIER_SIZE} bytes, got {}",
            identifier.len()
        );
    }
    let file = open_dir(mount_dir.as_ref())?;

    let mut arg = RemoveKeyArg {
        key_spec: KeySpecifier {
            spec_type: KEY_SPEC_TYPE_IDENTIFIER,
            reserved: 0,
            u: [0; 32],
        },
        removal_status_flags: 0,
        reserved: [0; 5],
    };
    arg.key_spec.u[..KEY_IDENTIFIER_SIZE].copy_from_slice(identifier);

    ioctl(
        &file,
        remove_key_request(),
        &mut arg as *mut _ as *mut libc::c_void,
    )
    .context(format!(
        "FS_IOC_REMOVE_ENCRYPTION_KEY failed on '{}'",
        mount_dir.as_ref().display()
    ))
}

fn open_dir(dir: &Path) -> Result<File, Error> {
    File::open(dir).context(format!("Failed to open directory '{}'", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_abi_sizes() {
        // Fixed by the kernel uapi; a mismatch corrupts the ioctl.
        assert_eq!(mem::size_of::<PolicyV1>(), 12);
        assert_eq!(mem::size_of::<PolicyV2>(), 24);
        assert_eq!(mem::size_of::<KeySpecifier>(), 40);
        assert_eq!(mem::size_of::<AddKeyArg>(), 80);
        assert_eq!(mem::size_of::<RemoveKeyArg>(), 64);
    }

    #[test]
    fn test_key_state_on_unencrypted_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = get_key_state(dir.path()).unwrap();
        // Plain tmp directories either lack a policy or sit on a
        // filesystem without fscrypt support.
        assert!(matches!(state, KeyState::NoKey | KeyState::NotSupported));
    }

    #[test]
    fn test_descriptor_length_is_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        set_policy_v1(dir.path(), &[0u8; 4]).unwrap_err();
        set_policy_v2(dir.path(), &[0u8; 4]).unwrap_err();
        remove_key_v2(dir.path(), &[0u8; 4]).unwrap_err();
    }
}

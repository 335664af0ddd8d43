use std::{ffi::CString, os::unix::ffi::OsStrExt, path::Path};

use anyhow::{Context, Error};

fn path_cstr(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .context(format!("Path '{}' contains a NUL byte", path.display()))
}

fn name_cstr(name: &str) -> Result<CString, Error> {
    CString::new(name).context(format!("Attribute name '{name}' contains a NUL byte"))
}

/// Reads an extended attribute. Returns `None` when the attribute is absent.
pub fn get(path: impl AsRef<Path>, name: &str) -> Result<Option<Vec<u8>>, Error> {
    let path_c = path_cstr(path.as_ref())?;
    let name_c = name_cstr(name)?;

    let size = unsafe {
        libc::getxattr(
            path_c.as_ptr(),
            name_c.as_ptr(),
            std::ptr::null_mut(),
            0,
        )
    };
    if size < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) => Ok(None),
            _ => Err(Error::new(err).context(format!(
                "Failed to read xattr '{}' of '{}'",
                name,
                path.as_ref().display()
            ))),
        };
    }

    let mut value = vec![0u8; size as usize];
    let read = unsafe {
        libc::getxattr(
            path_c.as_ptr(),
            name_c.as_ptr(),
            value.as_mut_ptr() as *mut libc::c_void,
            value.len(),
        )
    };
    if read < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) => Ok(None),
            _ => Err(Error::new(err).context(format!(
                "Failed to read xattr '{}' of '{}'",
                name,
                path.as_ref().display()
            ))),
        };
    }
    value.truncate(read as usize);
    Ok(Some(value))
}

/// Writes an extended attribute, replacing any previous value.
pub fn set(path: impl AsRef<Path>, name: &str, value: &[u8]) -> Result<(), Error> {
    let path_c = path_cstr(path.as_ref())?;
    let name_c = name_cstr(name)?;

    let ret = unsafe {
        libc::setxattr(
            path_c.as_ptr(),
            name_c.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if ret != 0 {
        return Err(Error::new(std::io::Error::last_os_error()).context(format!(
            "Failed to set xattr '{}' on '{}'",
            name,
            path.as_ref().display()
        )));
    }
    Ok(())
}

/// Removes an extended attribute. Absence is not an error.
pub fn remove(path: impl AsRef<Path>, name: &str) -> Result<bool, Error> {
    let path_c = path_cstr(path.as_ref())?;
    let name_c = name_cstr(name)?;

    let ret = unsafe { libc::removexattr(path_c.as_ptr(), name_c.as_ptr()) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) => Ok(false),
            _ => Err(Error::new(err).context(format!(
                "Failed to remove xattr '{}' from '{}'",
                name,
                path.as_ref().display()
            ))),
        };
    }
    Ok(true)
}

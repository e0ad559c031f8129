pub trait PrivilegeProbe: Send + Sync {
    fn is_elevated(&self) -> bool;
}

/// Asks the OS whether the current process runs elevated.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPrivilege;

impl PrivilegeProbe for ProcessPrivilege {
    fn is_elevated(&self) -> bool {
        is_process_elevated()
    }
}

impl<F> PrivilegeProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_elevated(&self) -> bool {
        self()
    }
}

#[cfg(unix)]
fn is_process_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(windows)]
fn is_process_elevated() -> bool {
    use std::ffi::c_void;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut token: HANDLE = std::ptr::null_mut();
    // SAFETY: the pseudo handle from GetCurrentProcess is always valid and
    // `token` is closed below once opened.
    unsafe {
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }
        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut returned = 0_u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut c_void,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);
        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(any(unix, windows)))]
fn is_process_elevated() -> bool {
    false
}

//! Windows networking (`Mpr.dll`) mounts.
#![cfg_attr(not(windows), allow(dead_code))]

use crate::error::ShareError;

const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_REM_NOT_LIST: u32 = 51;
const ERROR_BAD_NETPATH: u32 = 53;
const ERROR_BAD_NET_NAME: u32 = 67;
const ERROR_ALREADY_ASSIGNED: u32 = 85;
const ERROR_INVALID_PASSWORD: u32 = 86;
const ERROR_DEVICE_ALREADY_REMEMBERED: u32 = 1202;
const ERROR_NO_NET_OR_BAD_PATH: u32 = 1203;
const ERROR_SESSION_CREDENTIAL_CONFLICT: u32 = 1219;
const ERROR_NO_NETWORK: u32 = 1222;
const ERROR_NETWORK_UNREACHABLE: u32 = 1231;
const ERROR_HOST_UNREACHABLE: u32 = 1232;
const ERROR_LOGON_FAILURE: u32 = 1326;
const ERROR_NOT_CONNECTED: u32 = 2250;

/// Map a `WNet*` return code onto the share error taxonomy.
fn share_error(code: u32, unc: &str) -> ShareError {
    let unc = unc.to_string();
    match code {
        ERROR_ACCESS_DENIED | ERROR_INVALID_PASSWORD | ERROR_LOGON_FAILURE => {
            ShareError::Authentication { unc }
        }
        ERROR_REM_NOT_LIST
        | ERROR_BAD_NETPATH
        | ERROR_BAD_NET_NAME
        | ERROR_NO_NET_OR_BAD_PATH
        | ERROR_NO_NETWORK
        | ERROR_NETWORK_UNREACHABLE
        | ERROR_HOST_UNREACHABLE => ShareError::NetworkUnreachable { unc },
        ERROR_ALREADY_ASSIGNED
        | ERROR_DEVICE_ALREADY_REMEMBERED
        | ERROR_SESSION_CREDENTIAL_CONFLICT => ShareError::AlreadyMounted { unc },
        ERROR_NOT_CONNECTED => ShareError::MountNotFound { unc },
        other => ShareError::Platform {
            unc,
            reason: format!(
                "{} (code {other})",
                std::io::Error::from_raw_os_error(other as i32)
            ),
        },
    }
}

#[cfg(windows)]
pub use imp::WNetMount;

#[cfg(windows)]
mod imp {
    use std::ptr;

    use windows_sys::Win32::NetworkManagement::WNet::{
        CONNECT_INTERACTIVE, CONNECT_PROMPT, CONNECT_UPDATE_PROFILE, NETRESOURCEW,
        RESOURCETYPE_DISK, WNetAddConnection2W, WNetCancelConnection2W,
    };

    use super::share_error;
    use crate::config::Credential;
    use crate::error::ShareError;
    use crate::share::{MountHandle, RemoteShareMount};

    const NO_ERROR: u32 = 0;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Deviceless connections through `WNetAddConnection2W`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WNetMount;

    impl RemoteShareMount for WNetMount {
        fn mount(
            &self,
            unc: &str,
            credential: Option<&Credential>,
        ) -> Result<MountHandle, ShareError> {
            let mut remote = wide(unc);
            // SAFETY: NETRESOURCEW is a plain C struct; all-zero is a valid value.
            let mut resource: NETRESOURCEW = unsafe { std::mem::zeroed() };
            resource.dwType = RESOURCETYPE_DISK;
            resource.lpRemoteName = remote.as_mut_ptr();

            let code = match credential {
                Some(cred) => {
                    let user = wide(cred.principal());
                    let password = wide(cred.secret());
                    // SAFETY: every pointer references a live NUL-terminated buffer.
                    unsafe {
                        WNetAddConnection2W(&resource, password.as_ptr(), user.as_ptr(), 0)
                    }
                }
                // SAFETY: null credentials select the interactive prompt.
                None => unsafe {
                    WNetAddConnection2W(
                        &resource,
                        ptr::null(),
                        ptr::null(),
                        CONNECT_INTERACTIVE | CONNECT_PROMPT,
                    )
                },
            };

            if code != NO_ERROR {
                return Err(share_error(code, unc));
            }
            Ok(MountHandle::new(unc))
        }

        fn unmount(&self, handle: &MountHandle) -> Result<(), ShareError> {
            let name = wide(handle.unc());
            // SAFETY: `name` is NUL-terminated and outlives the call.
            let code = unsafe { WNetCancelConnection2W(name.as_ptr(), CONNECT_UPDATE_PROFILE, 0) };
            if code != NO_ERROR {
                return Err(share_error(code, handle.unc()));
            }
            Ok(())
        }
    }
}

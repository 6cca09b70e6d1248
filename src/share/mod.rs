//! Credentialed access to a remote network share.
//!
//! [`ShareConnector`] is the only code that touches OS-level mount state, and
//! it does so through a [`RemoteShareMount`] so the monitor can run against
//! any platform implementation (or a fake in tests).

#[cfg(unix)]
mod gio;
mod wnet;

use tracing::{debug, info};

use crate::config::Credential;
use crate::error::ShareError;

#[cfg(unix)]
pub use gio::GioMount;
#[cfg(windows)]
pub use wnet::WNetMount;

/// The mount implementation for the current target.
#[cfg(windows)]
pub type PlatformMount = WNetMount;
#[cfg(unix)]
pub type PlatformMount = GioMount;

/// Opaque token returned by a successful mount, needed to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    unc: String,
}

impl MountHandle {
    pub fn new(unc: impl Into<String>) -> Self {
        Self { unc: unc.into() }
    }

    pub fn unc(&self) -> &str {
        &self.unc
    }
}

/// Platform capability for binding and releasing a remote share.
pub trait RemoteShareMount: Send + Sync {
    /// Mount `unc` (`\\host`). Without a credential the platform may prompt.
    fn mount(&self, unc: &str, credential: Option<&Credential>) -> Result<MountHandle, ShareError>;

    /// Make `remote_path` (`\\host\share\...`, under a mounted host) readable
    /// and return the path file APIs should open. UNC paths work as they are
    /// where the OS resolves them itself.
    fn attach(
        &self,
        handle: &MountHandle,
        remote_path: &str,
        credential: Option<&Credential>,
    ) -> Result<String, ShareError> {
        let _ = (handle, credential);
        Ok(remote_path.to_string())
    }

    /// Release a mount, and anything attached through it. Reports
    /// [`ShareError::MountNotFound`] if nothing is mounted.
    fn unmount(&self, handle: &MountHandle) -> Result<(), ShareError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A live (or released) mount created by [`ShareConnector::connect`].
#[derive(Debug)]
pub struct ShareConnection {
    host: String,
    principal: Option<String>,
    handle: MountHandle,
    state: ConnectionState,
}

impl ShareConnection {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `\\host`
    pub fn remote_unc(&self) -> &str {
        self.handle.unc()
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

pub struct ShareConnector<M> {
    mount: M,
}

impl<M: RemoteShareMount> ShareConnector<M> {
    pub fn new(mount: M) -> Self {
        Self { mount }
    }

    pub fn mount(&self) -> &M {
        &self.mount
    }

    /// Single synchronous attempt; no retries.
    pub fn connect(
        &self,
        host: &str,
        credential: Option<&Credential>,
    ) -> Result<ShareConnection, ShareError> {
        let host = host.trim().trim_start_matches('\\');
        if host.is_empty() {
            return Err(ShareError::EmptyHost);
        }
        let unc = format!("\\\\{host}");
        let handle = self.mount.mount(&unc, credential)?;
        info!(
            unc = %unc,
            principal = credential.map(Credential::principal).unwrap_or("<interactive>"),
            "Connected to remote share"
        );
        Ok(ShareConnection {
            host: host.to_string(),
            principal: credential.map(|c| c.principal().to_string()),
            handle,
            state: ConnectionState::Connected,
        })
    }

    /// Local path for `remote_path` on a live `connection`.
    pub fn attach(
        &self,
        connection: &ShareConnection,
        remote_path: &str,
        credential: Option<&Credential>,
    ) -> Result<String, ShareError> {
        if !connection.is_connected() {
            return Err(ShareError::MountNotFound {
                unc: connection.remote_unc().to_string(),
            });
        }
        let local = self.mount.attach(&connection.handle, remote_path, credential)?;
        debug!(remote = %remote_path, %local, "Remote database attached");
        Ok(local)
    }

    /// Release `connection`. An already released connection yields
    /// [`ShareError::MountNotFound`]; ignoring it is the caller's call.
    pub fn disconnect(&self, connection: &mut ShareConnection) -> Result<(), ShareError> {
        if connection.state == ConnectionState::Disconnected {
            return Err(ShareError::MountNotFound {
                unc: connection.remote_unc().to_string(),
            });
        }
        match self.mount.unmount(&connection.handle) {
            Ok(()) => {
                connection.state = ConnectionState::Disconnected;
                info!(unc = %connection.remote_unc(), "Released remote share");
                Ok(())
            }
            Err(e @ ShareError::MountNotFound { .. }) => {
                connection.state = ConnectionState::Disconnected;
                debug!(unc = %connection.remote_unc(), "Share was already released");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMount {
        mounted: Mutex<HashSet<String>>,
        unmount_calls: Mutex<usize>,
    }

    impl RemoteShareMount for FakeMount {
        fn mount(&self, unc: &str, credential: Option<&Credential>) -> Result<MountHandle, ShareError> {
            if unc == r"\\OFFLINE" {
                return Err(ShareError::NetworkUnreachable { unc: unc.into() });
            }
            if credential.is_some_and(|c| c.secret() != "s3cret") {
                return Err(ShareError::Authentication { unc: unc.into() });
            }
            if !self.mounted.lock().unwrap().insert(unc.to_string()) {
                return Err(ShareError::AlreadyMounted { unc: unc.into() });
            }
            Ok(MountHandle::new(unc))
        }

        fn unmount(&self, handle: &MountHandle) -> Result<(), ShareError> {
            *self.unmount_calls.lock().unwrap() += 1;
            if self.mounted.lock().unwrap().remove(handle.unc()) {
                Ok(())
            } else {
                Err(ShareError::MountNotFound { unc: handle.unc().into() })
            }
        }
    }

    #[test]
    fn connects_with_valid_credential() {
        let connector = ShareConnector::new(FakeMount::default());
        let cred = Credential::new(r"corp\alice", "s3cret");
        let conn = connector.connect("HOST1", Some(&cred)).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.remote_unc(), r"\\HOST1");
        assert_eq!(conn.principal(), Some(r"corp\alice"));
    }

    #[test]
    fn bad_credential_leaves_nothing_mounted() {
        let connector = ShareConnector::new(FakeMount::default());
        let cred = Credential::new(r"corp\alice", "wrong");
        let err = connector.connect("HOST1", Some(&cred)).unwrap_err();
        assert!(matches!(err, ShareError::Authentication { .. }));
        assert!(connector.mount().mounted.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_host_is_rejected_before_mounting() {
        let connector = ShareConnector::new(FakeMount::default());
        assert!(matches!(connector.connect(" ", None), Err(ShareError::EmptyHost)));
        assert!(matches!(connector.connect(r"\\", None), Err(ShareError::EmptyHost)));
    }

    #[test]
    fn foreign_mount_is_reported() {
        let connector = ShareConnector::new(FakeMount::default());
        let _first = connector.connect("HOST1", None).unwrap();
        assert!(matches!(
            connector.connect("HOST1", None),
            Err(ShareError::AlreadyMounted { .. })
        ));
    }

    #[test]
    fn second_disconnect_reports_missing_mount_without_platform_call() {
        let connector = ShareConnector::new(FakeMount::default());
        let mut conn = connector.connect("HOST1", None).unwrap();
        connector.disconnect(&mut conn).unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = connector.disconnect(&mut conn).unwrap_err();
        assert!(matches!(err, ShareError::MountNotFound { .. }));
        assert_eq!(*connector.mount().unmount_calls.lock().unwrap(), 1);
    }

    #[test]
    fn unc_paths_attach_unchanged_until_released() {
        let connector = ShareConnector::new(FakeMount::default());
        let mut conn = connector.connect("HOST1", None).unwrap();
        let remote = r"\\HOST1\skype\alice\main.db";
        assert_eq!(connector.attach(&conn, remote, None).unwrap(), remote);

        connector.disconnect(&mut conn).unwrap();
        assert!(matches!(
            connector.attach(&conn, remote, None),
            Err(ShareError::MountNotFound { .. })
        ));
    }

    #[test]
    fn externally_released_mount_still_marks_disconnected() {
        let connector = ShareConnector::new(FakeMount::default());
        let mut conn = connector.connect("HOST1", None).unwrap();
        connector.mount().mounted.lock().unwrap().clear();

        assert!(matches!(
            connector.disconnect(&mut conn),
            Err(ShareError::MountNotFound { .. })
        ));
        assert!(!conn.is_connected());
    }
}

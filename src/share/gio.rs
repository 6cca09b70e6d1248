//! GVfs mounts via the `gio` command line tool.
//!
//! `smb://host/` only lists the server's shares. Files become readable once
//! `smb://host/share/` is mounted, under
//! `$XDG_RUNTIME_DIR/gvfs/smb-share:server=host,share=share/`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::config::Credential;
use crate::error::ShareError;
use crate::share::{MountHandle, RemoteShareMount};

/// Mounts `\\host` as `smb://host/` through `gio mount`, and each attached
/// share as `smb://host/share/`.
#[derive(Debug)]
pub struct GioMount {
    program: String,
    gvfs_root: PathBuf,
    /// Share locations this mount created, released with their host.
    shares: Mutex<Vec<String>>,
}

impl Default for GioMount {
    fn default() -> Self {
        Self::with_program("gio")
    }
}

impl GioMount {
    pub fn with_program(program: impl Into<String>) -> Self {
        let gvfs_root = dirs::runtime_dir()
            .map(|dir| dir.join("gvfs"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".gvfs")))
            .unwrap_or_else(|| PathBuf::from(".gvfs"));
        Self {
            program: program.into(),
            gvfs_root,
            shares: Mutex::new(Vec::new()),
        }
    }

    /// Directory GVfs exposes its FUSE mounts under.
    pub fn with_gvfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.gvfs_root = root.into();
        self
    }

    pub fn gvfs_root(&self) -> &Path {
        &self.gvfs_root
    }

    fn shares(&self) -> MutexGuard<'_, Vec<String>> {
        self.shares.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, args: &[&str], stdin: Option<String>, unc: &str) -> Result<Output, ShareError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::inherit()
            });

        let mut child = command.spawn().map_err(|e| ShareError::Platform {
            unc: unc.to_string(),
            reason: format!("failed to run {}: {e}", self.program),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // gio asks for user, domain and password in that order.
            pipe.write_all(input.as_bytes())
                .map_err(|e| ShareError::Platform {
                    unc: unc.to_string(),
                    reason: format!("failed to pass credentials: {e}"),
                })?;
        }

        child.wait_with_output().map_err(|e| ShareError::Platform {
            unc: unc.to_string(),
            reason: e.to_string(),
        })
    }
}

fn smb_location(unc: &str) -> String {
    let rest = unc.trim_start_matches('\\').replace('\\', "/");
    format!("smb://{rest}/")
}

/// A UNC path split into host, share and the components below the share.
#[derive(Debug, PartialEq, Eq)]
struct UncPath<'a> {
    host: &'a str,
    share: &'a str,
    rest: Vec<&'a str>,
}

impl<'a> UncPath<'a> {
    fn parse(unc: &'a str) -> Option<Self> {
        let mut parts = unc
            .trim_start_matches(['\\', '/'])
            .split(['\\', '/'])
            .filter(|part| !part.is_empty());
        let host = parts.next()?;
        let share = parts.next()?;
        Some(Self {
            host,
            share,
            rest: parts.collect(),
        })
    }

    fn share_location(&self) -> String {
        format!("smb://{}/{}/", self.host, self.share)
    }

    /// GVfs lowercases server and share names in its mount directories.
    fn local_path(&self, gvfs_root: &Path) -> PathBuf {
        let mut path = gvfs_root.join(format!(
            "smb-share:server={},share={}",
            self.host.to_lowercase(),
            self.share.to_lowercase()
        ));
        path.extend(self.rest.iter());
        path
    }
}

fn location_host(location: &str) -> &str {
    location
        .trim_start_matches("smb://")
        .split('/')
        .next()
        .unwrap_or_default()
}

fn prompt_answers(credential: &Credential) -> String {
    let (domain, user) = match credential.principal().split_once('\\') {
        Some((domain, user)) => (domain, user),
        None => ("", credential.principal()),
    };
    format!("{user}\n{domain}\n{}\n", credential.secret())
}

/// Classify `gio` diagnostics; there are no stable exit codes to go on.
fn classify(stderr: &str, unc: &str, unmounting: bool) -> ShareError {
    let text = stderr.to_lowercase();
    let unc = unc.to_string();
    if unmounting && (text.contains("not mounted") || text.contains("no such")) {
        ShareError::MountNotFound { unc }
    } else if text.contains("already mounted") {
        ShareError::AlreadyMounted { unc }
    } else if ["permission denied", "access denied", "logon failure", "password"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        ShareError::Authentication { unc }
    } else if [
        "failed to retrieve share list",
        "connection refused",
        "no route to host",
        "timed out",
        "could not resolve",
        "not found",
        "unreachable",
    ]
    .iter()
    .any(|needle| text.contains(needle))
    {
        ShareError::NetworkUnreachable { unc }
    } else {
        ShareError::Platform {
            unc,
            reason: stderr.trim().to_string(),
        }
    }
}

impl RemoteShareMount for GioMount {
    fn mount(&self, unc: &str, credential: Option<&Credential>) -> Result<MountHandle, ShareError> {
        let location = smb_location(unc);
        debug!(%location, "Running gio mount");
        let output = self.run(&["mount", &location], credential.map(prompt_answers), unc)?;
        if !output.status.success() {
            return Err(classify(&String::from_utf8_lossy(&output.stderr), unc, false));
        }
        Ok(MountHandle::new(unc))
    }

    fn attach(
        &self,
        handle: &MountHandle,
        remote_path: &str,
        credential: Option<&Credential>,
    ) -> Result<String, ShareError> {
        let parsed = UncPath::parse(remote_path).ok_or_else(|| ShareError::Platform {
            unc: remote_path.to_string(),
            reason: "path does not name a share".to_string(),
        })?;
        let location = parsed.share_location();
        debug!(%location, host = %handle.unc(), "Running gio mount");
        let output = self.run(&["mount", &location], credential.map(prompt_answers), remote_path)?;
        if output.status.success() {
            self.shares().push(location);
        } else {
            match classify(&String::from_utf8_lossy(&output.stderr), remote_path, false) {
                // Someone else's mount of the share reads just as well; it is not ours to release.
                ShareError::AlreadyMounted { .. } => {
                    debug!(%location, "Share already mounted");
                }
                e => return Err(e),
            }
        }
        Ok(parsed.local_path(&self.gvfs_root).to_string_lossy().into_owned())
    }

    fn unmount(&self, handle: &MountHandle) -> Result<(), ShareError> {
        let host = handle.unc().trim_start_matches('\\');
        let attached: Vec<String> = {
            let mut shares = self.shares();
            let (ours, others): (Vec<String>, Vec<String>) = shares
                .drain(..)
                .partition(|location| location_host(location).eq_ignore_ascii_case(host));
            *shares = others;
            ours
        };
        for location in attached {
            let output = self.run(&["mount", "-u", &location], Some(String::new()), handle.unc())?;
            if !output.status.success() {
                warn!(
                    %location,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Failed to unmount share"
                );
            }
        }

        let location = smb_location(handle.unc());
        let output = self.run(&["mount", "-u", &location], Some(String::new()), handle.unc())?;
        if !output.status.success() {
            return Err(classify(
                &String::from_utf8_lossy(&output.stderr),
                handle.unc(),
                true,
            ));
        }
        Ok(())
    }
}

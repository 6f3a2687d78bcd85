//! Execution identity: resolution in the parent, privilege drop in the child

use crate::{CorralError, Result};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid, User, getgrouplist};
use std::ffi::CString;

/// A resolved user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    /// Primary and supplementary groups from the group database
    pub groups: Vec<Gid>,
}

impl Identity {
    /// Look up `name` in the user database
    pub fn resolve(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(|e| CorralError::Identity(format!("cannot look up user '{name}': {e}")))?
            .ok_or_else(|| CorralError::Identity(format!("unknown user '{name}'")))?;

        let c_name = CString::new(user.name.as_bytes())
            .map_err(|_| CorralError::Identity(format!("user name {name:?} contains NUL")))?;
        let mut groups = getgrouplist(&c_name, user.gid).map_err(|e| {
            CorralError::Identity(format!("cannot list groups of '{name}': {e}"))
        })?;
        if !groups.contains(&user.gid) {
            groups.insert(0, user.gid);
        }

        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            groups,
        })
    }

    /// Whether running as this identity means changing credentials.
    ///
    /// Root always switches so supplementary groups are dropped too.
    #[must_use]
    pub fn requires_switch(&self) -> bool {
        let euid = Uid::effective();
        euid.is_root() || euid != self.uid
    }

    /// Credentials in the form the child consumes
    #[must_use]
    pub fn drop_plan(&self) -> PrivilegeDrop {
        PrivilegeDrop {
            uid: self.uid.as_raw(),
            gid: self.gid.as_raw(),
            groups: Uid::effective()
                .is_root()
                .then(|| self.groups.iter().map(|g| g.as_raw()).collect()),
        }
    }
}

/// Raw credential change applied in the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeDrop {
    uid: libc::uid_t,
    gid: libc::gid_t,
    /// Supplementary groups to install; `None` when not privileged to
    groups: Option<Vec<libc::gid_t>>,
}

impl PrivilegeDrop {
    /// Supplementary groups, gid, uid, then `no_new_privs`.
    ///
    /// Runs in the child, no allocation. Any failure aborts the launch, so
    /// the program never starts under the original identity.
    pub fn apply(&self) -> std::result::Result<(), Errno> {
        // SAFETY: plain credential syscalls on the calling process
        unsafe {
            if let Some(groups) = &self.groups {
                Errno::result(libc::setgroups(groups.len(), groups.as_ptr()))?;
            }
            Errno::result(libc::setgid(self.gid))?;
            Errno::result(libc::setuid(self.uid))?;

            if self.uid != 0 && libc::setuid(0) == 0 {
                return Err(Errno::EPERM);
            }

            let (on, zero): (libc::c_ulong, libc::c_ulong) = (1, 0);
            Errno::result(libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, zero, zero, zero))?;
        }
        Ok(())
    }
}

use crate::error::{TaskError, TaskResult};
use log::trace;
use nix::unistd::{getgrouplist, setgid, setgroups, setuid, Gid, Group, Uid, User};
use std::ffi::CString;

/// Resolved identity a task runs as: uid, gid and the packed supplementary
/// group list, captured once at prepare time.
#[derive(Debug, Clone)]
pub struct Cred {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

impl Default for Cred {
    fn default() -> Cred {
        Cred {
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            groups: Vec::new(),
        }
    }
}

impl Cred {
    pub fn is_root(&self) -> bool {
        self.uid.is_root()
    }

    /// Look up `user` and `group` in the host account database and collect
    /// the user's supplementary groups for the resolved primary gid.
    pub fn resolve(user: &str, group: &str) -> TaskResult<Cred> {
        let pwd = User::from_name(user)
            .map_err(|e| TaskError::os(e, format!("getpwnam({})", user)))?
            .ok_or_else(|| TaskError::invalid(format!("unknown user: {}", user)))?;

        let gid = if group.is_empty() {
            pwd.gid
        } else {
            Group::from_name(group)
                .map_err(|e| TaskError::os(e, format!("getgrnam({})", group)))?
                .ok_or_else(|| TaskError::invalid(format!("unknown group: {}", group)))?
                .gid
        };

        let user_cstr = CString::new(user)
            .map_err(|_| TaskError::invalid(format!("user name contains NUL: {}", user)))?;
        let groups = getgrouplist(&user_cstr, gid)
            .map_err(|e| TaskError::os(e, "Can't get supplementary group list"))?;

        Ok(Cred {
            uid: pwd.uid,
            gid,
            groups,
        })
    }

    /// Drop to this identity. The order is load-bearing: gid first (setgid
    /// requires privilege we are about to give up), then the supplementary
    /// groups, then uid last.
    pub fn apply(&self, verbose: bool) -> TaskResult<()> {
        setgid(self.gid).map_err(|e| TaskError::os(e, "setgid()"))?;

        if verbose {
            for (i, gid) in self.groups.iter().enumerate() {
                trace!("supplementary_group[{}]={}", i, gid);
            }
        }

        setgroups(&self.groups).map_err(|e| TaskError::os(e, "setgroups()"))?;

        setuid(self.uid).map_err(|e| TaskError::os(e, "setuid()"))?;

        Ok(())
    }
}

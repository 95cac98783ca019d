use crate::cred::Cred;
use crate::error::{TaskError, TaskResult};
use ::caps::{CapSet, Capability, CapsHashSet};
use std::sync::OnceLock;

/* Read once at daemon startup, before the first launch. */
static LAST_CAP: OnceLock<u8> = OnceLock::new();

/// One-time read of the kernel's highest capability index. Must run before
/// the first `Task::start`; the init asserts on it.
pub fn init_last_cap() -> TaskResult<()> {
    if LAST_CAP.get().is_some() {
        return Ok(());
    }

    let text = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap").map_err(|e| {
        TaskError::os(
            nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
            "read /proc/sys/kernel/cap_last_cap",
        )
    })?;
    let value: u8 = text
        .trim()
        .parse()
        .map_err(|_| TaskError::invalid(format!("unparsable cap_last_cap: {}", text.trim())))?;

    let _ = LAST_CAP.set(value);
    Ok(())
}

pub fn last_cap() -> TaskResult<u8> {
    LAST_CAP
        .get()
        .copied()
        .ok_or_else(|| TaskError::invalid("cap_last_cap was never read"))
}

fn mask_has(mask: u64, cap: Capability) -> bool {
    mask & (1u64 << cap.index()) != 0
}

/// Clamp the process to `mask`. Only meaningful when the task runs as
/// root; for any other credential execve never grants capabilities and
/// the kernel bounding set is irrelevant.
///
/// Effective and permitted stay full (the init still has mounting and
/// credential work to do), inheritable becomes the mask, and every
/// capability outside the mask is dropped from the bounding set.
/// CAP_SETPCAP goes last: dropping it earlier would make the remaining
/// bounding-set drops fail.
pub fn apply_capabilities(mask: u64, cred: &Cred) -> TaskResult<()> {
    if !cred.is_root() {
        return Ok(());
    }

    let ceiling = last_cap()?;

    let supported: CapsHashSet = ::caps::all()
        .into_iter()
        .filter(|c| c.index() <= ceiling)
        .collect();
    let inheritable: CapsHashSet = supported
        .iter()
        .copied()
        .filter(|c| mask_has(mask, *c))
        .collect();

    ::caps::set(None, CapSet::Permitted, &supported)
        .map_err(|e| TaskError::invalid(format!("set permitted capabilities: {}", e)))?;
    ::caps::set(None, CapSet::Effective, &supported)
        .map_err(|e| TaskError::invalid(format!("set effective capabilities: {}", e)))?;
    ::caps::set(None, CapSet::Inheritable, &inheritable)
        .map_err(|e| TaskError::invalid(format!("set inheritable capabilities: {}", e)))?;

    for cap in supported.iter() {
        if !mask_has(mask, *cap) && *cap != Capability::CAP_SETPCAP {
            ::caps::drop(None, CapSet::Bounding, *cap)
                .map_err(|e| TaskError::invalid(format!("drop bounding {}: {}", cap, e)))?;
        }
    }

    if !mask_has(mask, Capability::CAP_SETPCAP) {
        ::caps::drop(None, CapSet::Bounding, Capability::CAP_SETPCAP)
            .map_err(|e| TaskError::invalid(format!("drop bounding CAP_SETPCAP: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_has() {
        let mask = 1u64 << Capability::CAP_NET_BIND_SERVICE.index();
        assert!(mask_has(mask, Capability::CAP_NET_BIND_SERVICE));
        assert!(!mask_has(mask, Capability::CAP_SYS_ADMIN));
        assert!(!mask_has(0, Capability::CAP_SETPCAP));
    }

    #[test]
    fn test_init_last_cap() {
        init_last_cap().expect("read cap_last_cap");
        let ceiling = last_cap().expect("initialized");
        /* CAP_SETPCAP has existed since 2.2, anything lower means the
         * parse went wrong. */
        assert!(ceiling >= Capability::CAP_SETPCAP.index());
    }

    #[test]
    fn test_non_root_is_noop() {
        let cred = Cred {
            uid: nix::unistd::Uid::from_raw(1000),
            gid: nix::unistd::Gid::from_raw(1000),
            groups: vec![],
        };
        apply_capabilities(0, &cred).expect("no-op for non-root");
    }
}

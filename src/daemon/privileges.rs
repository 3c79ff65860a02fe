//! Dropping to `--uid`/`--gid` before the worker starts.

use crate::error::LaunchError;

/// Switches the process to `uid`/`gid` (names or numbers). When only a user is
/// given, its primary group is used. A no-op when neither is set.
#[cfg(unix)]
pub fn maybe_drop_privileges(uid: Option<&str>, gid: Option<&str>) -> Result<(), LaunchError> {
    use nix::unistd::{setgid, setuid, Uid};

    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    let user = uid.map(resolve_user).transpose()?;
    let group = match gid {
        Some(gid) => Some(resolve_group(gid)?),
        None => user.as_ref().and_then(|(_, primary, _)| *primary),
    };

    if let (Some((_, _, Some(name))), Some(group)) = (&user, group) {
        init_groups(name, group)?;
    }

    if let Some(group) = group {
        setgid(group).map_err(|e| LaunchError::Privileges(format!("setgid({group}): {e}")))?;
    }

    if let Some((uid, _, _)) = user {
        setuid(uid).map_err(|e| LaunchError::Privileges(format!("setuid({uid}): {e}")))?;
        if !uid.is_root() && setuid(Uid::from_raw(0)).is_ok() {
            return Err(LaunchError::Privileges(
                "still able to regain root after dropping privileges".to_string(),
            ));
        }
    }

    tracing::debug!(component = "launch", ?uid, ?gid, "Dropped privileges");
    Ok(())
}

#[cfg(not(unix))]
pub fn maybe_drop_privileges(uid: Option<&str>, gid: Option<&str>) -> Result<(), LaunchError> {
    if uid.is_some() || gid.is_some() {
        tracing::warn!(component = "launch", "--uid/--gid are ignored on this platform");
    }
    Ok(())
}

#[cfg(unix)]
type ResolvedUser = (nix::unistd::Uid, Option<nix::unistd::Gid>, Option<String>);

/// Resolves a user to its uid and, if it has a passwd entry, its primary gid
/// and login name.
#[cfg(unix)]
fn resolve_user(raw: &str) -> Result<ResolvedUser, LaunchError> {
    use nix::unistd::{Uid, User};

    let entry = |u: User| (u.uid, Some(u.gid), Some(u.name));
    let lookup = match raw.parse::<u32>() {
        Ok(id) => User::from_uid(Uid::from_raw(id))
            .map(|user| user.map(entry).or(Some((Uid::from_raw(id), None, None)))),
        Err(_) => User::from_name(raw).map(|user| user.map(entry)),
    };

    lookup
        .map_err(|e| LaunchError::Privileges(format!("user {raw:?}: {e}")))?
        .ok_or_else(|| LaunchError::Privileges(format!("user {raw:?} does not exist")))
}

/// Supplementary groups of `name`. Only root may change them; anyone else
/// keeps their current set.
#[cfg(target_os = "linux")]
fn init_groups(name: &str, group: nix::unistd::Gid) -> Result<(), LaunchError> {
    use nix::errno::Errno;
    use std::ffi::CString;

    let cname = CString::new(name)
        .map_err(|_| LaunchError::Privileges(format!("invalid user name {name:?}")))?;
    match nix::unistd::initgroups(&cname, group) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) => {
            tracing::debug!(component = "launch", user = name, "Not permitted to set supplementary groups");
            Ok(())
        }
        Err(e) => Err(LaunchError::Privileges(format!("initgroups({name}): {e}"))),
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn init_groups(_name: &str, _group: nix::unistd::Gid) -> Result<(), LaunchError> {
    Ok(())
}

#[cfg(unix)]
fn resolve_group(raw: &str) -> Result<nix::unistd::Gid, LaunchError> {
    use nix::unistd::{Gid, Group};

    if let Ok(id) = raw.parse::<u32>() {
        return Ok(Gid::from_raw(id));
    }
    Group::from_name(raw)
        .map_err(|e| LaunchError::Privileges(format!("group {raw:?}: {e}")))?
        .map(|group| group.gid)
        .ok_or_else(|| LaunchError::Privileges(format!("group {raw:?} does not exist")))
}

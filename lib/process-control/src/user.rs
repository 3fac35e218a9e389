/// Returns the login name of the user running this process.
///
/// On Unix, the password database entry for the real user ID is consulted, falling back to the `USER` environment
/// variable. Elsewhere, the `USERNAME` environment variable is used.
#[cfg(unix)]
pub fn current_user_name() -> Option<String> {
    lookup_password_entry().or_else(|| std::env::var("USER").ok().filter(|name| !name.is_empty()))
}

/// Returns the login name of the user running this process.
///
/// On Unix, the password database entry for the real user ID is consulted, falling back to the `USER` environment
/// variable. Elsewhere, the `USERNAME` environment variable is used.
#[cfg(not(unix))]
pub fn current_user_name() -> Option<String> {
    std::env::var("USERNAME").ok().filter(|name| !name.is_empty())
}

#[cfg(unix)]
fn lookup_password_entry() -> Option<String> {
    use std::{ffi::CStr, mem::MaybeUninit, ptr};

    const MAX_BUFFER_LEN: usize = 1 << 20;

    // SAFETY: `getuid` is always successful and has no preconditions.
    let uid = unsafe { libc::getuid() };

    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        let mut entry = MaybeUninit::<libc::passwd>::uninit();
        let mut result: *mut libc::passwd = ptr::null_mut();

        // SAFETY: All pointers are valid for the duration of the call, and `buf.len()` is the true length of `buf`.
        let rc = unsafe { libc::getpwuid_r(uid, entry.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && buf.len() < MAX_BUFFER_LEN {
            let new_len = buf.len() * 2;
            buf.resize(new_len, 0);
            continue;
        }

        if rc != 0 || result.is_null() {
            return None;
        }

        // SAFETY: `result` is non-null, so `getpwuid_r` populated `entry`, and `pw_name` points into `buf`, which is
        // still alive.
        let name = unsafe { CStr::from_ptr((*result).pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn resolves_current_user() {
        let name = current_user_name().expect("user name");
        assert!(!name.is_empty());
        assert!(!name.contains('/'));
    }
}

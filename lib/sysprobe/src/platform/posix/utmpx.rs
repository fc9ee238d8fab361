use crate::{
    error::Result,
    platform::posix::c_chars_to_string,
    types::{Pid, User},
};

/// An open cursor over the utmpx database, closed on drop.
struct UtmpxCursor;

impl UtmpxCursor {
    fn open() -> Self {
        // SAFETY: `setutxent` has no preconditions.
        unsafe { libc::setutxent() };
        Self
    }

    fn next_entry(&mut self) -> Option<libc::utmpx> {
        // SAFETY: The returned pointer is valid until the next call, and we copy the entry out right away.
        let entry = unsafe { libc::getutxent() };
        if entry.is_null() {
            return None;
        }
        Some(unsafe { *entry })
    }
}

impl Drop for UtmpxCursor {
    fn drop(&mut self) {
        // SAFETY: `endutxent` has no preconditions.
        unsafe { libc::endutxent() };
    }
}

#[cfg(not(target_os = "netbsd"))]
fn user_name(entry: &libc::utmpx) -> String {
    c_chars_to_string(&entry.ut_user)
}

#[cfg(target_os = "netbsd")]
fn user_name(entry: &libc::utmpx) -> String {
    c_chars_to_string(&entry.ut_name)
}

/// Users with a login session, from the utmpx database.
pub(crate) fn users() -> Result<Vec<User>> {
    let mut cursor = UtmpxCursor::open();
    let mut users = Vec::new();

    while let Some(entry) = cursor.next_entry() {
        if i32::from(entry.ut_type) != i32::from(libc::USER_PROCESS) {
            continue;
        }

        let terminal = c_chars_to_string(&entry.ut_line);
        let host = c_chars_to_string(&entry.ut_host);
        users.push(User {
            name: user_name(&entry),
            terminal: (!terminal.is_empty()).then_some(terminal),
            host: (!host.is_empty()).then_some(host),
            started: entry.ut_tv.tv_sec as f64 + entry.ut_tv.tv_usec as f64 / 1_000_000.0,
            pid: Some(entry.ut_pid as Pid),
        });
    }

    Ok(users)
}

//! Pseudo-terminal allocation.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub width: u16,
    pub height: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// A freshly opened master/slave pair.
pub(crate) struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub name: String,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Open a new pty and size it.
pub(crate) fn open(size: PtySize) -> io::Result<PtyPair> {
    // SAFETY: plain libc calls on descriptors owned by this function.
    let master = check(unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) })?;
    // SAFETY: posix_openpt returned a new descriptor that nothing else owns.
    let master = unsafe { OwnedFd::from_raw_fd(master) };
    let fd = master.as_raw_fd();

    // SAFETY: `fd` is a valid open descriptor for the calls below.
    unsafe {
        check(libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        check(libc::grantpt(fd))?;
        check(libc::unlockpt(fd))?;
    }

    let name = slave_name(fd)?;
    let path = CString::new(name.clone())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pty name contains nul"))?;
    // SAFETY: `path` is a valid C string for the duration of the call.
    let slave = check(unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC,
        )
    })?;
    // SAFETY: open returned a new descriptor that nothing else owns.
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    set_size(slave.as_raw_fd(), size)?;
    Ok(PtyPair {
        master,
        slave,
        name,
    })
}

#[cfg(target_os = "linux")]
fn slave_name(fd: RawFd) -> io::Result<String> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: `buf` is writable for `buf.len()` bytes and nul-terminated on success.
    let ret = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    // SAFETY: ptsname_r succeeded, so `buf` holds a nul-terminated string.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn slave_name(fd: RawFd) -> io::Result<String> {
    // SAFETY: ptsname returns a pointer to static storage or null.
    let ptr = unsafe { libc::ptsname(fd) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: non-null result is a nul-terminated string.
    let name = unsafe { CStr::from_ptr(ptr) };
    Ok(name.to_string_lossy().into_owned())
}

/// Set the window size of the terminal behind `fd`.
pub(crate) fn set_size(fd: RawFd, size: PtySize) -> io::Result<()> {
    let winsize = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `winsize` is a valid struct for TIOCSWINSZ.
    check(unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize) })?;
    Ok(())
}

/// Read back the window size of the terminal behind `fd`.
pub(crate) fn get_size(fd: RawFd) -> io::Result<PtySize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `winsize` is a valid, writable struct for TIOCGWINSZ.
    check(unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) })?;
    Ok(PtySize {
        width: winsize.ws_col,
        height: winsize.ws_row,
    })
}

/// Child-side setup, run between fork and exec: new session with the pty
/// slave (already on fd 0) as controlling terminal.
pub(crate) fn make_controlling_terminal() -> io::Result<()> {
    // SAFETY: async-signal-safe calls only.
    unsafe {
        check(libc::setsid())?;
        check(libc::ioctl(0, libc::TIOCSCTTY as _, 0))?;
    }
    Ok(())
}

use crate::{*, error::*};
use std::{ffi::CString, fmt::Write as fmtWrite, io, mem, mem::ManuallyDrop, ops::FnOnce, os::fd::{FromRawFd, OwnedFd}, ptr};

// Epoll fd. Closed in destructor.
pub struct Epoll {
    fd: i32,
}

impl Epoll {
    pub fn new() -> Result<Epoll> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 { return errno_err!("epoll_create1(0) failed"); }
            Ok(Epoll {fd: fd})
        }
    }

    pub fn add(&self, fd: i32, events: i32, data: u64) -> Result<()> {
        unsafe {
            let mut event = libc::epoll_event {events: events as u32, u64: data};
            let r = libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event);
            if r != 0 { return errno_err!("epoll_ctl(EPOLL_CTL_ADD) failed"); }
        }
        Ok(())
    }

    pub fn del(&self, fd: i32) -> Result<()> {
        unsafe {
            let r = libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
            if r != 0 { return errno_err!("epoll_ctl(EPOLL_CTL_DEL) failed"); }
        }
        Ok(())
    }

    // Returns Ok(0) on EINTR.
    pub fn wait(&self, out: &mut [libc::epoll_event]) -> Result<usize> {
        unsafe {
            let r = libc::epoll_wait(self.fd, out.as_mut_ptr(), out.len() as i32, -1);
            if r < 0 {
                if *libc::__errno_location() == libc::EINTR {
                    return Ok(0);
                }
                return errno_err!("epoll_wait() failed");
            }
            Ok(r as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let r = libc::close(self.fd);
            if r != 0 { log_warning!("close() failed on epoll fd: {:?}", io::Error::last_os_error()); }
        }
    }
}

// The command pipe. Both ends are nonblocking: the write end may be poked from a signal
// handler, the read end is drained from an epoll loop.
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

pub fn create_pipe() -> Result<Pipe> {
    unsafe {
        let mut fds = [0i32; 2];
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
            return errno_err!("pipe2() failed");
        }
        for fd in fds {
            if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) != 0 {
                return errno_err!("fcntl(F_SETFL, O_NONBLOCK) failed");
            }
        }
        Ok(Pipe {read: OwnedFd::from_raw_fd(fds[0]), write: OwnedFd::from_raw_fd(fds[1])})
    }
}

// The memfd_create(2) NAME parameter needs to be at most 249 bytes (excluding the
// terminating null byte): an entry named "memfd:NAME" shows up in /proc/PID/fd, and that
// entry must be under the 255-byte NAME_MAX limit.
// The name is only there to help debugging, so when trimming keep the parts that carry
// information: the "file://" prefix and the offset/size tail.
fn trim_memfd_name(name: &str) -> String {
    const LIMIT: usize = 255 - 6; // strlen("memfd:")
    if name.len() <= LIMIT {
        return name.to_string();
    }
    const PREFIX: &str = "file://";
    const GAP: &str = "[...]";
    let keep_tail = LIMIT - PREFIX.len() - GAP.len();
    let mut start = name.len() - keep_tail;
    while !name.is_char_boundary(start) {
        start += 1;
    }
    format!("{}{}{}", PREFIX, GAP, &name[start..])
}

// An anonymous file to back a code object: an in-memory file with seals allowed and
// close-on-exec, falling back to an unlinked temp file on kernels without memfd.
pub fn create_anonymous_file(name: &str) -> Result<OwnedFd> {
    unsafe {
        let cname = CString::new(trim_memfd_name(name).replace('\0', "_"))?;
        let fd = libc::memfd_create(cname.as_ptr(), libc::MFD_ALLOW_SEALING | libc::MFD_CLOEXEC);
        if fd >= 0 {
            return Ok(OwnedFd::from_raw_fd(fd));
        }
        let fd = libc::open(b"/tmp\0".as_ptr() as *const libc::c_char, libc::O_TMPFILE | libc::O_RDWR | libc::O_CLOEXEC, 0o666);
        if fd < 0 {
            return errno_err!("could not create a temporary file");
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

pub unsafe fn memcpy_struct<'a, T: Copy>(data: &'a [u8], name: &str) -> Result<(T, &'a [u8])> {
    if data.len() < mem::size_of::<T>() {
        return err!(MalformedExecutable, "{} out of bounds: {} < {} bytes", name, data.len(), mem::size_of::<T>());
    }
    let mut t: T = mem::zeroed();
    ptr::copy_nonoverlapping(data.as_ptr(), &mut t as *mut T as *mut u8, mem::size_of::<T>());
    Ok((t, &data[mem::size_of::<T>()..]))
}

pub fn hexdump(data: &[u8], limit: usize) -> String {
    let mut r = String::new();
    for &b in &data[..data.len().min(limit)] {
        let _ = write!(r, "{:02x}", b);
    }
    if data.len() > limit {
        r.push_str("...");
    }
    r
}

pub struct ScopeGuard<F: FnOnce()> { f: ManuallyDrop<F> }
impl<F: FnOnce()> ScopeGuard<F> { pub fn new(f: F) -> Self { Self {f: ManuallyDrop::new(f)} } }
impl<T: FnOnce()> Drop for ScopeGuard<T> { fn drop(&mut self) { (unsafe {ManuallyDrop::take(&mut self.f)})(); } }
#[macro_export]
macro_rules! defer { ($($t:tt)*) => { let _guard = ScopeGuard::new(|| { $($t)* }); }; }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn anonymous_file_round_trip() {
        let fd = create_anonymous_file("file:///tmp/foo.so#offset=0x1000&size=4096").unwrap();
        let mut file = std::fs::File::from(fd);
        file.write_all(b"wavefront").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "wavefront");
    }

    #[test]
    fn memfd_name_trimming() {
        let short = "file:///x#offset=1&size=2";
        assert_eq!(trim_memfd_name(short), short);

        let long = format!("file:///{}#offset=0x7f0000&size=0x4000", "a".repeat(400));
        let trimmed = trim_memfd_name(&long);
        assert_eq!(trimmed.len(), 255 - 6);
        assert!(trimmed.starts_with("file://[...]"));
        assert!(trimmed.ends_with("#offset=0x7f0000&size=0x4000"));
    }
}

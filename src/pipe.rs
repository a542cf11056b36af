//! Close-on-exec pipe used to learn whether a child's execve succeeded.
//!
//! The child keeps the write end across the exec. A successful exec closes it
//! and the parent reads EOF; a failed exec writes the errno first.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, read, write};

pub struct Pipe {
    rfd: RawFd,
    wfd: RawFd,
}

impl Pipe {
    pub fn new() -> nix::Result<Self> {
        // Sets as close-on-execution
        let (rfd, wfd) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Pipe { rfd, wfd })
    }

    /// Child side, after a failed exec. Only async-signal-safe calls.
    pub fn report(&self, errno: Errno) {
        let bytes = (errno as i32).to_ne_bytes();
        let _ = write(self.wfd, &bytes);
    }

    /// Parent side. `Ok` once the write end closed without a report.
    pub fn wait_exec(self) -> Result<(), Errno> {
        let _ = close(self.wfd);
        let mut buf = [0u8; 4];
        let mut filled = 0;
        let result = loop {
            match read(self.rfd, &mut buf[filled..]) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        break Err(Errno::from_i32(i32::from_ne_bytes(buf)));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => break Err(errno),
            }
        };
        let _ = close(self.rfd);
        result
    }

    /// Releases both ends without waiting, for when the child never started.
    pub fn close(self) {
        let _ = close(self.rfd);
        let _ = close(self.wfd);
    }
}

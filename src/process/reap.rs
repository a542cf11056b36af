use nix::errno::Errno;

use crate::process::command::log_exit;
use crate::syscall::Syscall;

// Gives up after this many wait errors in a row that are not ECHILD.
const MAX_CONSECUTIVE_WAIT_ERRORS: usize = 64;

/// Reaps children until the kernel reports there are none left.
///
/// Every descendant re-parented to PID 1 ends up here. Exit statuses are
/// logged and dropped. Returns how many children were reaped.
pub fn wait_orphans(syscall: &dyn Syscall) -> usize {
    let mut reaped = 0;
    let mut errors = 0;

    loop {
        match syscall.wait_any() {
            Ok(status) => {
                log_exit("orphan", status);
                reaped += 1;
                errors = 0;
            }
            Err(e) => match e.errno() {
                Some(Errno::ECHILD) => break,
                Some(Errno::EINTR) => continue,
                _ => {
                    log::warn!("Error from wait for orphaned children: {}", e);
                    errors += 1;
                    if errors >= MAX_CONSECUTIVE_WAIT_ERRORS {
                        log::error!("giving up on reaping after {} errors", errors);
                        break;
                    }
                }
            },
        }
    }

    reaped
}

//! Eventfd wakeup for the completion reactor.
//!
//! `send` runs on application threads; the io_uring submission queue
//! belongs to the poll path. The notifier bridges the two: a write to
//! the eventfd completes the ring's pending read and wakes the poller.
//! Multiple notifies before the read coalesce into one wakeup
//! (eventfd counter semantics).

use std::os::unix::io::RawFd;

use gannet_core::{ErrorKind, NetResult};

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    pub fn create() -> NetResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            let e = unsafe { *libc::__errno_location() };
            return Err(ErrorKind::QueueCreate(e));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> NetResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            // EAGAIN means the counter is saturated — a wakeup is
            // already pending, which is all we wanted.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(ErrorKind::SendFailed(errno));
        }
        Ok(())
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_and_drain() {
        let n = EventFdNotifier::create().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();

        // Both notifies coalesce into one counter read
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                n.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(ret, 8);
        assert_eq!(val, 2);

        // Counter now empty: non-blocking read reports EAGAIN
        let ret = unsafe {
            libc::read(
                n.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert!(ret < 0);
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::GpioError;
use crate::gpio::SysfsGateway;

const SYSFS_VALUE_TOKEN: u64 = 0;
const SYSFS_WAKE_TOKEN: u64 = 1;

/// Gateway onto the real `/sys/class/gpio` tree.
#[derive(Debug, Default)]
pub struct KernelSysfs;

/// An epoll instance watching one value descriptor, plus an eventfd used to
/// kick blocked waiters out when the registration is closed.
pub struct EpollRegistration {
    epoll: Epoll,
    wake: EventFd,
    closed: AtomicBool,
}

impl KernelSysfs {
    pub fn new() -> Self {
        Self
    }
}

fn errno_error(context: impl std::fmt::Display, errno: Errno) -> GpioError {
    GpioError::from_io(context, std::io::Error::from(errno))
}

impl SysfsGateway for KernelSysfs {
    type ValueFile = File;
    type Registration = EpollRegistration;

    fn read_attribute(&self, path: &Path) -> Result<String, GpioError> {
        fs::read_to_string(path)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| GpioError::from_io(format!("read {}", path.display()), e))
    }

    fn write_attribute(&self, path: &Path, value: &str) -> Result<(), GpioError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| GpioError::from_io(format!("open {}", path.display()), e))?;
        file.write_all(value.as_bytes())
            .map_err(|e| GpioError::from_io(format!("write {value:?} to {}", path.display()), e))
    }

    fn open_value(&self, path: &Path) -> Result<Self::ValueFile, GpioError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
            .map_err(|e| GpioError::from_io(format!("open {}", path.display()), e))
    }

    fn read_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, GpioError> {
        file.read_at(buf, offset)
            .map_err(|e| GpioError::from_io("read value", e))
    }

    fn write_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), GpioError> {
        file.write_all_at(buf, offset)
            .map_err(|e| GpioError::from_io("write value", e))
    }

    fn arm(&self, file: &Self::ValueFile) -> Result<Self::Registration, GpioError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| errno_error("epoll_create", e))?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| errno_error("eventfd", e))?;

        epoll
            .add(
                file,
                EpollEvent::new(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLET,
                    SYSFS_VALUE_TOKEN,
                ),
            )
            .map_err(|e| errno_error("epoll_ctl value", e))?;
        epoll
            .add(
                &wake,
                EpollEvent::new(EpollFlags::EPOLLIN, SYSFS_WAKE_TOKEN),
            )
            .map_err(|e| errno_error("epoll_ctl wake", e))?;

        Ok(EpollRegistration {
            epoll,
            wake,
            closed: AtomicBool::new(false),
        })
    }

    fn wait(
        &self,
        registration: &Self::Registration,
        timeout: Option<Duration>,
    ) -> Result<(), GpioError> {
        if registration.closed.load(Ordering::Acquire) {
            return Err(GpioError::Cancelled);
        }
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(t) => EpollTimeout::try_from(t).map_err(|_| {
                GpioError::InvalidValue(format!("timeout {t:?} exceeds epoll range"))
            })?,
        };

        let mut events = [EpollEvent::empty(); 2];
        let n = match registration.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Err(GpioError::Interrupted),
            Err(e) => return Err(errno_error("epoll_wait", e)),
        };

        if registration.closed.load(Ordering::Acquire)
            || events[..n].iter().any(|e| e.data() == SYSFS_WAKE_TOKEN)
        {
            return Err(GpioError::Cancelled);
        }
        if n == 0 {
            return Err(GpioError::Timeout);
        }
        Ok(())
    }

    fn close(&self, registration: &Self::Registration) -> Result<(), GpioError> {
        if registration.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // descriptors go with the last reference; this only wakes waiters
        registration
            .wake
            .write(1)
            .map(|_| ())
            .map_err(|e| errno_error("eventfd write", e))
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;
    use std::sync::{Arc, mpsc};
    use std::thread;

    use super::*;

    // A pipe's read end stands in for a value descriptor: readable data
    // raises the same readiness an edge would.
    fn armed_pipe() -> (KernelSysfs, EpollRegistration, File, std::io::PipeWriter) {
        let (reader, writer) = std::io::pipe().unwrap();
        let file = File::from(OwnedFd::from(reader));
        let sysfs = KernelSysfs::new();
        let registration = sysfs.arm(&file).unwrap();
        (sysfs, registration, file, writer)
    }

    #[test]
    fn close_wakes_blocked_waiter_with_cancelled() {
        let (sysfs, registration, _file, _writer) = armed_pipe();
        let registration = Arc::new(registration);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let registration = registration.clone();
            thread::spawn(move || {
                let _ = tx.send(KernelSysfs::new().wait(&registration, None));
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        sysfs.close(&registration).unwrap();
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(GpioError::Cancelled)));
        waiter.join().unwrap();

        assert!(matches!(
            sysfs.wait(&registration, None),
            Err(GpioError::Cancelled)
        ));
        sysfs.close(&registration).unwrap();
    }

    #[test]
    fn readable_data_completes_wait() {
        let (sysfs, registration, _file, mut writer) = armed_pipe();
        assert!(matches!(
            sysfs.wait(&registration, Some(Duration::from_millis(20))),
            Err(GpioError::Timeout)
        ));

        writer.write_all(b"1").unwrap();
        // well past what fits in 16 bits of milliseconds
        sysfs
            .wait(&registration, Some(Duration::from_secs(70)))
            .unwrap();

        // edge triggered: nothing new until the next write
        assert!(matches!(
            sysfs.wait(&registration, Some(Duration::from_millis(20))),
            Err(GpioError::Timeout)
        ));
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        let (sysfs, registration, _file, _writer) = armed_pipe();
        assert!(matches!(
            sysfs.wait(&registration, Some(Duration::MAX)),
            Err(GpioError::InvalidValue(_))
        ));
    }
}

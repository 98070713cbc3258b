//! Serial lines (ttys). Configured through termios; watched like any other descriptor.

use std::io;
use std::mem;
use std::path::Path;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::watchable::Watchable;

/// Standard rates and their termios speed codes.
static BAUD_RATES: &[(u32, libc::speed_t)] = &[
    (0, libc::B0),
    (50, libc::B50),
    (75, libc::B75),
    (110, libc::B110),
    (134, libc::B134),
    (150, libc::B150),
    (200, libc::B200),
    (300, libc::B300),
    (600, libc::B600),
    (1200, libc::B1200),
    (1800, libc::B1800),
    (2400, libc::B2400),
    (4800, libc::B4800),
    (9600, libc::B9600),
    (19200, libc::B19200),
    (38400, libc::B38400),
    (57600, libc::B57600),
    (115200, libc::B115200),
    (230400, libc::B230400),
    #[cfg(target_os = "linux")]
    (460800, libc::B460800),
    #[cfg(target_os = "linux")]
    (500000, libc::B500000),
    #[cfg(target_os = "linux")]
    (576000, libc::B576000),
    #[cfg(target_os = "linux")]
    (921600, libc::B921600),
    #[cfg(target_os = "linux")]
    (1000000, libc::B1000000),
    #[cfg(target_os = "linux")]
    (1152000, libc::B1152000),
    #[cfg(target_os = "linux")]
    (1500000, libc::B1500000),
    #[cfg(target_os = "linux")]
    (2000000, libc::B2000000),
    #[cfg(target_os = "linux")]
    (2500000, libc::B2500000),
    #[cfg(target_os = "linux")]
    (3000000, libc::B3000000),
    #[cfg(target_os = "linux")]
    (3500000, libc::B3500000),
    #[cfg(target_os = "linux")]
    (4000000, libc::B4000000),
];

fn speed_code(baud: u32) -> Option<libc::speed_t> {
    BAUD_RATES
        .iter()
        .find(|&&(rate, _)| rate == baud)
        .map(|&(_, code)| code)
}

fn baud_of(code: libc::speed_t) -> Option<u32> {
    BAUD_RATES
        .iter()
        .find(|&&(_, c)| c == code)
        .map(|&(rate, _)| rate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone)]
pub struct Serial {
    handle: Handle,
}

impl Serial {
    /// Open read-write, non-blocking, without becoming the controlling terminal.
    pub fn open(path: impl AsRef<Path>) -> Result<Serial> {
        let handle = Handle::open(path, libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK)?;
        Ok(Serial { handle })
    }

    fn get(&self) -> Result<libc::termios> {
        let fd = self.handle.require().map_err(|source| Error::Device {
            op: "tcgetattr",
            source,
        })?;
        // SAFETY: termios is plain old data; tcgetattr fills it.
        let mut tio: libc::termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
            return Err(Error::device("tcgetattr"));
        }
        Ok(tio)
    }

    fn set(&self, tio: &libc::termios) -> Result<()> {
        let fd = self.handle.require().map_err(|source| Error::Device {
            op: "tcsetattr",
            source,
        })?;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, tio) } < 0 {
            return Err(Error::device("tcsetattr"));
        }
        Ok(())
    }

    /// Output speed in baud; `None` for a code outside the standard table.
    pub fn speed(&self) -> Result<Option<u32>> {
        let tio = self.get()?;
        Ok(baud_of(unsafe { libc::cfgetospeed(&tio) }))
    }

    /// Sets input and output speed. Only standard rates are accepted.
    pub fn set_speed(&self, baud: u32) -> Result<()> {
        let code = speed_code(baud).ok_or(Error::UnsupportedBaudRate(baud))?;
        let mut tio = self.get()?;
        unsafe {
            libc::cfsetispeed(&mut tio, code);
            libc::cfsetospeed(&mut tio, code);
        }
        self.set(&tio)?;
        if self.speed()? != Some(baud) {
            return Err(not_applied("speed"));
        }
        tracing::debug!(fd = self.handle.fd(), baud, "serial speed set");
        Ok(())
    }

    pub fn parity(&self) -> Result<Parity> {
        let tio = self.get()?;
        Ok(match (tio.c_cflag & libc::PARENB != 0, tio.c_cflag & libc::PARODD != 0) {
            (false, _) => Parity::None,
            (true, true) => Parity::Odd,
            (true, false) => Parity::Even,
        })
    }

    /// tcsetattr succeeds when any part of the change was applied, so the result is
    /// read back. A device that keeps its old parity (a pty, for one) is an error.
    pub fn set_parity(&self, parity: Parity) -> Result<()> {
        let mut tio = self.get()?;
        match parity {
            Parity::None => tio.c_cflag &= !libc::PARENB,
            Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => {
                tio.c_cflag |= libc::PARENB;
                tio.c_cflag &= !libc::PARODD;
            }
        }
        self.set(&tio)?;
        if self.parity()? != parity {
            return Err(not_applied("parity"));
        }
        tracing::debug!(fd = self.handle.fd(), ?parity, "serial parity set");
        Ok(())
    }

    /// 8N1, no echo, no line discipline, no flow-control translation.
    pub fn make_raw(&self) -> Result<()> {
        let mut tio = self.get()?;
        tio.c_iflag &= !(libc::IGNBRK
            | libc::BRKINT
            | libc::PARMRK
            | libc::ISTRIP
            | libc::INLCR
            | libc::IGNCR
            | libc::ICRNL
            | libc::IXON);
        tio.c_oflag &= !libc::OPOST;
        tio.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
        tio.c_cflag &= !(libc::CSIZE | libc::PARENB);
        tio.c_cflag |= libc::CS8;
        self.set(&tio)
    }
}

fn not_applied(what: &str) -> Error {
    Error::Device {
        op: "tcsetattr",
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{what} not applied by device"),
        ),
    }
}

impl Watchable for Serial {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::ffi::CStr;

    /// Master side of a fresh pseudo-terminal plus the path of its slave.
    /// `None` where the sandbox has no devpts.
    fn pty() -> Option<(Handle, String)> {
        let master = Handle::open("/dev/ptmx", libc::O_RDWR | libc::O_NOCTTY).ok()?;
        let fd = master.fd();
        assert_eq!(unsafe { libc::grantpt(fd) }, 0);
        assert_eq!(unsafe { libc::unlockpt(fd) }, 0);
        let mut name = [0 as libc::c_char; 128];
        assert_eq!(
            unsafe { libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) },
            0
        );
        let path = unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Some((master, path))
    }

    #[test]
    fn table_lookups_are_inverse() {
        for &(rate, code) in BAUD_RATES {
            assert_eq!(speed_code(rate), Some(code));
            assert_eq!(baud_of(code), Some(rate));
        }
        assert_eq!(speed_code(12345), None);
    }

    #[test]
    fn nonstandard_rate_is_rejected() {
        let Some((_master, path)) = pty() else {
            return;
        };
        let serial = Serial::open(&path).unwrap();
        assert!(matches!(
            serial.set_speed(12345),
            Err(Error::UnsupportedBaudRate(12345))
        ));
    }

    #[test]
    fn speed_round_trips_on_pty() {
        let Some((_master, path)) = pty() else {
            return;
        };
        let serial = Serial::open(&path).unwrap();
        serial.make_raw().unwrap();
        serial.set_speed(115200).unwrap();
        assert_eq!(serial.speed().unwrap(), Some(115200));

        serial.set_parity(Parity::None).unwrap();
        assert_eq!(serial.parity().unwrap(), Parity::None);
    }

    #[test]
    fn parity_the_device_drops_is_reported() {
        let Some((_master, path)) = pty() else {
            return;
        };
        let serial = Serial::open(&path).unwrap();
        serial.make_raw().unwrap();

        // Linux ptys clear PARENB on every tcsetattr.
        for parity in [Parity::Odd, Parity::Even] {
            match serial.set_parity(parity) {
                Ok(()) => assert_eq!(serial.parity().unwrap(), parity),
                Err(err) => {
                    assert!(
                        matches!(&err, Error::Device { op: "tcsetattr", source }
                            if source.kind() == io::ErrorKind::Unsupported),
                        "{err}"
                    );
                    assert_eq!(serial.parity().unwrap(), Parity::None);
                }
            }
            serial.set_parity(Parity::None).unwrap();
        }
    }

    #[test]
    fn missing_device_is_acquisition_error() {
        let err = Serial::open("/dev/does-not-exist-readyloop").unwrap_err();
        assert!(matches!(err, Error::Acquisition { .. }));
    }
}

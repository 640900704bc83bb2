//! Listener inheritance from file descriptors.
//!
//! A forked child finds its listening sockets at `LISTEN_FDS_START + offset`,
//! where `offset` is the address's position in the `--socketorder` argument
//! (or `0` when exactly one listener is inherited and no order is given).
//! Fails hard if an expected descriptor is missing or is not a socket: a
//! half-inherited set of listeners would silently drop an address.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use thiserror::Error;
use tokio::net::TcpListener;

/// First descriptor number after stdin, stdout and stderr.
pub const LISTEN_FDS_START: RawFd = 3;

/// Exported descriptors are parked at or above this number so that placing
/// them into `LISTEN_FDS_START..` in the child never clobbers another source.
pub const INHERIT_FD_FLOOR: RawFd = 100;

/// Errors raised while adopting inherited descriptors.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("{count} listeners configured but no socket order was passed by the parent")]
    MissingOrder { count: usize },

    #[error("socket order lists {order} addresses but {count} listeners are configured")]
    CountMismatch { order: usize, count: usize },

    #[error("address {0} is not present in the inherited socket order")]
    UnknownAddress(String),

    #[error("address {0} appears more than once in the inherited socket order")]
    DuplicateAddress(String),

    #[error("inherited fd {fd} for {address} is not a valid socket")]
    NotASocket { fd: RawFd, address: String },

    #[error("failed to adopt inherited fd {fd} for {address}: {source}")]
    Adopt {
        fd: RawFd,
        address: String,
        #[source]
        source: io::Error,
    },
}

/// What a process was told about inherited listeners on its command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inheritance {
    /// Set when this process was spawned by a restart.
    pub is_child: bool,
    /// Addresses in the order their descriptors were placed.
    pub order: Vec<String>,
}

impl Inheritance {
    /// A cold start: nothing inherited.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(order: Vec<String>) -> Self {
        Self {
            is_child: true,
            order,
        }
    }

    /// Check that the order names exactly the configured `addresses`,
    /// before any descriptor is inspected or adopted.
    pub fn validate(&self, addresses: &[&str]) -> Result<(), InheritError> {
        if !self.is_child {
            return Ok(());
        }
        let count = addresses.len();
        if self.order.is_empty() {
            return if count > 1 {
                Err(InheritError::MissingOrder { count })
            } else {
                Ok(())
            };
        }
        if self.order.len() != count {
            return Err(InheritError::CountMismatch {
                order: self.order.len(),
                count,
            });
        }
        for (i, address) in self.order.iter().enumerate() {
            if self.order[..i].contains(address) {
                return Err(InheritError::DuplicateAddress(address.clone()));
            }
        }
        match addresses.iter().find(|a| !self.order.iter().any(|o| o == *a)) {
            Some(missing) => Err(InheritError::UnknownAddress(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Descriptor number holding the listener for `address`.
    pub fn descriptor_for(&self, address: &str) -> Result<RawFd, InheritError> {
        if self.order.is_empty() {
            return Ok(LISTEN_FDS_START);
        }
        self.order
            .iter()
            .position(|a| a == address)
            .map(|offset| LISTEN_FDS_START + offset as RawFd)
            .ok_or_else(|| InheritError::UnknownAddress(address.to_string()))
    }

    /// Take ownership of the inherited listener for `address`.
    pub fn adopt(&self, address: &str) -> Result<TcpListener, InheritError> {
        let fd = self.descriptor_for(address)?;

        if !is_socket(fd) {
            return Err(InheritError::NotASocket {
                fd,
                address: address.to_string(),
            });
        }

        let adopt_err = |source| InheritError::Adopt {
            fd,
            address: address.to_string(),
            source,
        };

        // SAFETY: fstat confirmed `fd` is an open socket, and the inheritance
        // contract gives this process sole ownership of it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        set_cloexec(fd).map_err(adopt_err)?;
        std_listener.set_nonblocking(true).map_err(adopt_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(adopt_err)?;

        tracing::info!(
            fd,
            address = %address,
            local_addr = ?listener.local_addr().ok(),
            "Inherited listener from parent process"
        );
        Ok(listener)
    }
}

/// Validate that a file descriptor is a socket using fstat.
pub fn is_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Duplicate `fd` to the lowest free number `>= floor`, close-on-exec set.
pub fn dup_above(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Inherited descriptors arrive without close-on-exec; set it again so a
/// later fork only passes on what it places explicitly.
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn order(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn root_process_validates_anything() {
        assert!(Inheritance::root().validate(&[":1", ":2", ":3"]).is_ok());
    }

    #[test]
    fn single_listener_without_order_uses_first_slot() {
        let inheritance = Inheritance::child(Vec::new());
        inheritance.validate(&[":8080"]).unwrap();
        assert_eq!(inheritance.descriptor_for(":8080").unwrap(), 3);
    }

    #[test]
    fn several_listeners_require_order() {
        let inheritance = Inheritance::child(Vec::new());
        assert!(matches!(
            inheritance.validate(&[":8080", ":8443"]),
            Err(InheritError::MissingOrder { count: 2 })
        ));
    }

    #[test]
    fn order_length_must_match() {
        let inheritance = Inheritance::child(order(&[":8080"]));
        assert!(matches!(
            inheritance.validate(&[":8080", ":8443"]),
            Err(InheritError::CountMismatch { order: 1, count: 2 })
        ));
    }

    #[test]
    fn offsets_follow_order() {
        let inheritance = Inheritance::child(order(&[":8080", ":8443"]));
        inheritance.validate(&[":8443", ":8080"]).unwrap();
        assert_eq!(inheritance.descriptor_for(":8080").unwrap(), 3);
        assert_eq!(inheritance.descriptor_for(":8443").unwrap(), 4);
        assert!(matches!(
            inheritance.descriptor_for(":9000"),
            Err(InheritError::UnknownAddress(_))
        ));
    }

    #[test]
    fn order_must_name_every_configured_address() {
        let inheritance = Inheritance::child(order(&[":8080", ":9000"]));
        assert!(matches!(
            inheritance.validate(&[":8080", ":8443"]),
            Err(InheritError::UnknownAddress(ref a)) if a == ":8443"
        ));
    }

    #[test]
    fn order_must_not_repeat_an_address() {
        let inheritance = Inheritance::child(order(&[":8080", ":8080"]));
        assert!(matches!(
            inheritance.validate(&[":8080", ":8443"]),
            Err(InheritError::DuplicateAddress(ref a)) if a == ":8080"
        ));
    }

    #[test]
    fn invalid_fd_detection() {
        assert!(!is_socket(9999));
        assert!(!is_socket(-1));
    }

    #[test]
    fn dup_above_lands_high_with_cloexec() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dup = dup_above(listener.as_raw_fd(), INHERIT_FD_FLOOR).unwrap();
        assert!(dup.as_raw_fd() >= INHERIT_FD_FLOOR);
        assert!(is_socket(dup.as_raw_fd()));

        let flags = unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}

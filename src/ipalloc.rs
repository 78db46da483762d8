//! Pool of operator-registered fixed IP addresses.
//!
//! An address must be registered before it can be handed out, is handed out
//! to at most one container at a time, and goes back to the pool on release.

use std::collections::BTreeMap;
use std::net::IpAddr;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpAllocError {
    #[error("trying to register {0} which is already registered")]
    AlreadyRegistered(IpAddr),

    #[error("trying to unregister {ip} which is in use by {container}")]
    InUse { ip: IpAddr, container: String },

    #[error("trying to unregister {0} which is not in the fixed ip pool")]
    NotRegistered(IpAddr),

    #[error("requested fixed ip {0} is already allocated")]
    AlreadyAllocated(IpAddr),

    #[error("requested ip {0} is out of range")]
    OutOfRange(IpAddr),

    #[error("no available fixed ips")]
    NoAvailable,
}

/// Registered address -> owning container, `None` while available.
#[derive(Debug, Default)]
pub struct FixedIpAllocator {
    pool: Mutex<BTreeMap<IpAddr, Option<String>>>,
}

impl FixedIpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses to the pool. Nothing is registered if any is already present.
    pub fn register(&self, ips: &[IpAddr]) -> Result<(), IpAllocError> {
        let mut pool = self.pool.lock();
        if let Some(ip) = ips.iter().find(|ip| pool.contains_key(ip)) {
            return Err(IpAllocError::AlreadyRegistered(*ip));
        }
        for ip in ips {
            pool.insert(*ip, None);
        }
        Ok(())
    }

    /// Remove addresses from the pool. Nothing is removed if any is unknown or allocated.
    pub fn unregister(&self, ips: &[IpAddr]) -> Result<(), IpAllocError> {
        let mut pool = self.pool.lock();
        for ip in ips {
            match pool.get(ip) {
                None => return Err(IpAllocError::NotRegistered(*ip)),
                Some(Some(container)) => {
                    return Err(IpAllocError::InUse {
                        ip: *ip,
                        container: container.clone(),
                    });
                }
                Some(None) => {}
            }
        }
        for ip in ips {
            pool.remove(ip);
        }
        Ok(())
    }

    /// Hand `ip` (or any free address when `None`) to `container`. Asking again
    /// for an address the container already holds succeeds.
    pub fn request(&self, container: &str, ip: Option<IpAddr>) -> Result<IpAddr, IpAllocError> {
        let mut pool = self.pool.lock();
        match ip {
            Some(ip) => match pool.get_mut(&ip) {
                None => Err(IpAllocError::OutOfRange(ip)),
                Some(Some(owner)) if owner.as_str() != container => {
                    Err(IpAllocError::AlreadyAllocated(ip))
                }
                Some(slot) => {
                    *slot = Some(container.to_string());
                    Ok(ip)
                }
            },
            None => {
                let (ip, slot) = pool
                    .iter_mut()
                    .find(|(_, owner)| owner.is_none())
                    .ok_or(IpAllocError::NoAvailable)?;
                *slot = Some(container.to_string());
                Ok(*ip)
            }
        }
    }

    pub fn release(&self, ip: IpAddr) {
        let mut pool = self.pool.lock();
        match pool.get_mut(&ip) {
            Some(slot @ Some(_)) => *slot = None,
            Some(None) => log::info!("trying to release an unallocated fixed ip {ip}"),
            None => log::info!("trying to release an unregistered fixed ip {ip}"),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<IpAddr, Option<String>> {
        self.pool.lock().clone()
    }
}

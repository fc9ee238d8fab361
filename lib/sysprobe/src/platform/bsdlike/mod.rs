//! Helpers shared by macOS and the BSDs, whose kernels expose the same `sysctl`, routing socket and mount interfaces.

pub(crate) mod ifnet;
pub(crate) mod mounts;
pub(crate) mod sockets;
pub(crate) mod sysctl;

use crate::{error::Result, types::LoadAvg};

/// Load averages from `getloadavg(3)`.
pub(crate) fn load_avg() -> Result<LoadAvg> {
    let mut loads = [0f64; 3];
    // SAFETY: `loads` has room for the three requested samples.
    if unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) } != 3 {
        return Err(crate::error::Error::last_os_error("getloadavg"));
    }
    Ok(LoadAvg {
        one: loads[0],
        five: loads[1],
        fifteen: loads[2],
    })
}

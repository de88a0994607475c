use crate::rmi::{self, error::Error, Monitor};

pub fn decode_version(version: usize) -> (usize, usize) {
    let major = (version & 0x7fff0000) >> 16;
    let minor = version & 0xffff;

    (major, minor)
}

pub fn encode_version() -> usize {
    (rmi::ABI_MAJOR_VERSION << 16) | rmi::ABI_MINOR_VERSION
}

pub fn check(monitor: &dyn Monitor) -> Result<(), Error> {
    let ours = encode_version();
    let (lower, higher) = monitor.version(ours).map_err(|e| {
        warn!("RMI_VERSION not supported by the monitor: {:?}", e);
        e
    })?;

    trace!("RMI_ABI_VERSION: {:#X?} {:#X?}", lower, higher);

    if lower != ours {
        let (major, minor) = decode_version(lower);
        warn!(
            "Unsupported RMI ABI ({}, {}), we support ({}, {})",
            major,
            minor,
            rmi::ABI_MAJOR_VERSION,
            rmi::ABI_MINOR_VERSION
        );
        return Err(Error::RmiErrorInput);
    }

    info!(
        "RMI ABI version {}.{}",
        rmi::ABI_MAJOR_VERSION,
        rmi::ABI_MINOR_VERSION
    );
    Ok(())
}

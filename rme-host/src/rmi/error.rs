use crate::rmi::{ERROR_INPUT, ERROR_IN_USE, ERROR_REALM, ERROR_REC, ERROR_RTT, INCOMPLETE, SUCCESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    RmiErrorInput,
    /// Realm state error; the index is reported by the monitor.
    RmiErrorRealm(usize),
    RmiErrorRec,
    /// A table walk stopped at the carried level.
    RmiErrorRtt(usize),
    RmiErrorInUse,
    RmiErrorIncomplete,
    //// The below are host-side errors that never travel through the monitor
    RmiErrorOthers(InternalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalError {
    OutOfMemory,
    NotInitialized,
    VmidExhausted,
    Unexpected,
}

impl Error {
    /// Decodes a raw monitor return value: status in [7:0], index in [15:8].
    pub fn decode(ret: usize) -> Result<(), Error> {
        let status = ret & 0xFF;
        let index = (ret >> 8) & 0xFF;
        match status {
            SUCCESS => Ok(()),
            ERROR_INPUT => Err(Error::RmiErrorInput),
            ERROR_REALM => Err(Error::RmiErrorRealm(index)),
            ERROR_REC => Err(Error::RmiErrorRec),
            ERROR_RTT => Err(Error::RmiErrorRtt(index)),
            ERROR_IN_USE => Err(Error::RmiErrorInUse),
            INCOMPLETE => Err(Error::RmiErrorIncomplete),
            _ => Err(Error::RmiErrorOthers(InternalError::Unexpected)),
        }
    }
}

impl From<Error> for usize {
    fn from(err: Error) -> Self {
        match err {
            Error::RmiErrorInput => ERROR_INPUT,
            Error::RmiErrorRealm(index) => ERROR_REALM | (index << 8),
            Error::RmiErrorRec => ERROR_REC,
            Error::RmiErrorRtt(level) => ERROR_RTT | (level << 8),
            Error::RmiErrorInUse => ERROR_IN_USE,
            Error::RmiErrorIncomplete => INCOMPLETE,
            Error::RmiErrorOthers(_) => 0xFF,
        }
    }
}

pub mod params;
pub mod run;

pub use self::params::{Params, RmiRecFlags};
pub use self::run::Run;

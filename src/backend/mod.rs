pub mod mock;
#[cfg(feature = "hardware-gpio")]
pub mod sysfs;

pub use mock::MockSysfs;
#[cfg(feature = "hardware-gpio")]
pub use sysfs::KernelSysfs;

pub mod backend;
pub mod config;
mod dispatch;
pub mod error;
pub mod gpio;
mod watch;

pub use config::{AppConfig, Direction, EdgeDetect, PinConfig, SysfsConfig};
pub use error::GpioError;
pub use gpio::{EdgeEvent, GpioManager, Pin, SysfsGateway, Value};

#[cfg(feature = "hardware-gpio")]
pub use backend::KernelSysfs;
pub use backend::MockSysfs;

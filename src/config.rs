use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 64;

/// Location of the kernel GPIO class directory.
///
/// Built once at startup and handed to [`GpioManager::new`](crate::GpioManager::new);
/// every export, unexport and attribute path is derived from it, so nothing
/// reaches for a global.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SysfsConfig {
    pub gpio_root: PathBuf,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            gpio_root: PathBuf::from(DEFAULT_GPIO_ROOT),
        }
    }
}

impl SysfsConfig {
    pub fn new<P: Into<PathBuf>>(gpio_root: P) -> Self {
        Self {
            gpio_root: gpio_root.into(),
        }
    }

    pub fn export_path(&self) -> PathBuf {
        self.gpio_root.join("export")
    }

    pub fn unexport_path(&self) -> PathBuf {
        self.gpio_root.join("unexport")
    }

    pub fn attribute_path(&self, line: u32, attribute: &str) -> PathBuf {
        self.gpio_root.join(format!("gpio{line}")).join(attribute)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(GpioError::InvalidValue(format!("unknown direction {other:?}"))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeDetect::None => "none",
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }
}

impl fmt::Display for EdgeDetect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeDetect {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(EdgeDetect::None),
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(GpioError::InvalidValue(format!("unknown edge mode {other:?}"))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub line: u32,
    pub direction: Direction,
    #[serde(default)]
    pub edge: EdgeDetect,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub sysfs: SysfsConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
}

fn default_event_buffer_capacity() -> usize {
    DEFAULT_EVENT_BUFFER_CAPACITY
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        if config.event_buffer_capacity == 0 {
            return Err(GpioError::Config(
                "event_buffer_capacity must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::config::{Direction, EdgeDetect, SysfsConfig};
use crate::error::GpioError;
use crate::watch::Watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Low,
    High,
}

impl Value {
    pub fn as_u8(self) -> u8 {
        match self {
            Value::Low => 0,
            Value::High => 1,
        }
    }

    pub fn as_ascii(self) -> u8 {
        b'0' + self.as_u8()
    }

    pub fn from_ascii(byte: u8) -> Result<Self, GpioError> {
        match byte {
            b'0' => Ok(Value::Low),
            b'1' => Ok(Value::High),
            other => Err(GpioError::InvalidValue(format!(
                "value attribute holds {:?}",
                char::from(other)
            ))),
        }
    }
}

impl From<bool> for Value {
    fn from(high: bool) -> Self {
        if high { Value::High } else { Value::Low }
    }
}

impl From<Value> for bool {
    fn from(value: Value) -> Self {
        matches!(value, Value::High)
    }
}

impl TryFrom<u8> for Value {
    type Error = GpioError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Value::Low),
            1 => Ok(Value::High),
            _ => Err(GpioError::InvalidValue("Value must be 0 or 1".into())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// A value observed after an edge, stamped when the dispatcher read it so
/// buffered consumers still see when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub timestamp_ms: u64,
    pub value: Value,
}

impl EdgeEvent {
    pub fn now(value: Value) -> Self {
        Self {
            timestamp_ms: epoch_millis(),
            value,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the pin layer needs from the kernel: small text attributes,
/// a persistent value descriptor, and readiness registrations on it.
///
/// A freshly armed registration reports readiness once with the pin's
/// current level before any real edge. Implementations must reproduce that,
/// and `close` must make a concurrent `wait` on the same registration return
/// [`GpioError::Cancelled`].
pub trait SysfsGateway: Send + Sync + 'static {
    type ValueFile: Send + Sync + 'static;
    type Registration: Send + Sync + 'static;

    fn read_attribute(&self, path: &Path) -> Result<String, GpioError>;
    fn write_attribute(&self, path: &Path, value: &str) -> Result<(), GpioError>;

    fn open_value(&self, path: &Path) -> Result<Self::ValueFile, GpioError>;
    fn read_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, GpioError>;
    fn write_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), GpioError>;

    fn arm(&self, file: &Self::ValueFile) -> Result<Self::Registration, GpioError>;
    fn wait(
        &self,
        registration: &Self::Registration,
        timeout: Option<Duration>,
    ) -> Result<(), GpioError>;
    fn close(&self, registration: &Self::Registration) -> Result<(), GpioError>;
}

pub struct GpioManager<G: SysfsGateway> {
    config: Arc<SysfsConfig>,
    gateway: Arc<G>,
}

impl<G: SysfsGateway> GpioManager<G> {
    pub fn new(config: Arc<SysfsConfig>, gateway: Arc<G>) -> Self {
        Self { config, gateway }
    }

    pub fn config(&self) -> &SysfsConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Handle for `line` without touching the kernel.
    pub fn pin(&self, line: u32) -> Pin<G> {
        Pin {
            inner: Arc::new(PinInner {
                line,
                config: self.config.clone(),
                gateway: self.gateway.clone(),
                state: Mutex::new(PinState {
                    exported: false,
                    edge: EdgeDetect::None,
                    value_file: None,
                }),
                arming: Mutex::new(()),
                slot: Mutex::new(None),
            }),
        }
    }

    pub fn export(&self, line: u32, direction: Option<Direction>) -> Result<Pin<G>, GpioError> {
        let pin = self.pin(line);
        if let Err(e) = pin.export(direction) {
            if pin.is_exported()
                && let Err(close_err) = pin.close()
            {
                warn!("gpio{line}: release after failed export: {close_err}");
            }
            return Err(e);
        }
        Ok(pin)
    }
}

/// One kernel GPIO line. Clones share the same exported state and watch.
pub struct Pin<G: SysfsGateway> {
    pub(crate) inner: Arc<PinInner<G>>,
}

impl<G: SysfsGateway> Clone for Pin<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PinInner<G: SysfsGateway> {
    pub(crate) line: u32,
    pub(crate) config: Arc<SysfsConfig>,
    pub(crate) gateway: Arc<G>,
    pub(crate) state: Mutex<PinState<G>>,
    // serializes arming and teardown; never held while waiting for readiness
    pub(crate) arming: Mutex<()>,
    pub(crate) slot: Mutex<Option<Arc<Watch<G>>>>,
}

pub(crate) struct PinState<G: SysfsGateway> {
    pub(crate) exported: bool,
    pub(crate) edge: EdgeDetect,
    pub(crate) value_file: Option<Arc<G::ValueFile>>,
}

impl<G: SysfsGateway> Pin<G> {
    pub fn line(&self) -> u32 {
        self.inner.line
    }

    pub fn is_exported(&self) -> bool {
        self.inner.state.lock().exported
    }

    /// Edge mode last written to the `edge` attribute.
    pub fn edge(&self) -> EdgeDetect {
        self.inner.state.lock().edge
    }

    pub fn export(&self, direction: Option<Direction>) -> Result<(), GpioError> {
        {
            let mut state = self.inner.state.lock();
            if state.exported {
                return Err(GpioError::ResourceBusy(format!(
                    "gpio{} already exported",
                    self.inner.line
                )));
            }
            self.inner.gateway.write_attribute(
                &self.inner.config.export_path(),
                &self.inner.line.to_string(),
            )?;
            state.exported = true;
            state.edge = EdgeDetect::None;
        }
        debug!("gpio{}: exported", self.inner.line);

        if let Some(direction) = direction {
            self.set_direction(direction)?;
        }
        Ok(())
    }

    pub fn direction(&self) -> Result<Direction, GpioError> {
        self.inner
            .gateway
            .read_attribute(&self.attribute_path("direction"))?
            .parse()
    }

    pub fn set_direction(&self, direction: Direction) -> Result<(), GpioError> {
        self.inner
            .gateway
            .write_attribute(&self.attribute_path("direction"), direction.as_str())
    }

    pub fn read_value(&self) -> Result<Value, GpioError> {
        let file = self.value_file()?;
        self.read_from(&file)
    }

    /// Drives the line. The kernel rejects this unless direction is `out`.
    pub fn write_value(&self, value: Value) -> Result<(), GpioError> {
        let file = self.value_file()?;
        self.inner
            .gateway
            .write_value_at(&file, &[value.as_ascii()], 0)
    }

    /// Best-effort teardown: stops edge detection, drops the value
    /// descriptor and unexports. Every step runs; the first failure is
    /// returned afterwards. Closing an unexported pin does nothing.
    pub fn close(&self) -> Result<(), GpioError> {
        let mut first_error = self.cancel().err();

        let mut state = self.inner.state.lock();
        state.value_file = None;
        if state.exported {
            match self.inner.gateway.write_attribute(
                &self.inner.config.unexport_path(),
                &self.inner.line.to_string(),
            ) {
                Ok(()) => {
                    state.exported = false;
                    state.edge = EdgeDetect::None;
                    debug!("gpio{}: unexported", self.inner.line);
                }
                Err(e) => {
                    warn!("gpio{}: unexport failed: {e}", self.inner.line);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn attribute_path(&self, attribute: &str) -> PathBuf {
        self.inner.config.attribute_path(self.inner.line, attribute)
    }

    /// The value descriptor is opened once and reused until `close`.
    pub(crate) fn value_file(&self) -> Result<Arc<G::ValueFile>, GpioError> {
        let mut state = self.inner.state.lock();
        if let Some(file) = &state.value_file {
            return Ok(file.clone());
        }
        let file = Arc::new(
            self.inner
                .gateway
                .open_value(&self.attribute_path("value"))?,
        );
        state.value_file = Some(file.clone());
        Ok(file)
    }

    pub(crate) fn read_from(&self, file: &G::ValueFile) -> Result<Value, GpioError> {
        let mut buf = [0u8; 1];
        let n = self.inner.gateway.read_value_at(file, &mut buf, 0)?;
        if n == 0 {
            return Err(GpioError::Io(format!(
                "gpio{}: empty value attribute",
                self.inner.line
            )));
        }
        Value::from_ascii(buf[0])
    }

    /// Writes the `edge` attribute unless it already holds `mode`.
    pub(crate) fn set_edge(&self, mode: EdgeDetect) -> Result<(), GpioError> {
        let mut state = self.inner.state.lock();
        if state.edge == mode {
            return Ok(());
        }
        self.inner
            .gateway
            .write_attribute(&self.attribute_path("edge"), mode.as_str())?;
        state.edge = mode;
        Ok(())
    }
}

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Direction, EdgeDetect, SysfsConfig};
use crate::error::GpioError;
use crate::gpio::{SysfsGateway, Value};

/// In-memory stand-in for `/sys/class/gpio`.
///
/// Behaves like the kernel where the pin layer can tell: export/unexport
/// control files, text attributes, a value file that only fires readiness
/// on edges matching the `edge` attribute, and registrations that report
/// once with the current level as soon as they are armed. Readiness is a
/// flag, so edges arriving before a waiter wakes collapse into one.
///
/// Every attribute write attempt and registration call is counted for tests.
pub struct MockSysfs {
    root: PathBuf,
    state: Mutex<MockState>,
    open_files: Arc<AtomicUsize>,
}

struct MockState {
    driver_loaded: bool,
    denied: FxHashSet<u32>,
    arm_failures: FxHashSet<u32>,
    lines: FxHashMap<u32, MockLine>,
    writes: Vec<(PathBuf, String)>,
    read_offsets: Vec<u64>,
    value_opens: usize,
    arms: usize,
    closes: usize,
    live_registrations: usize,
    peak_registrations: usize,
}

struct MockLine {
    direction: Direction,
    edge: EdgeDetect,
    value: Value,
    watchers: Vec<Arc<MockReadiness>>,
}

impl Default for MockLine {
    fn default() -> Self {
        Self {
            direction: Direction::In,
            edge: EdgeDetect::None,
            value: Value::Low,
            watchers: Vec::new(),
        }
    }
}

pub struct MockValueFile {
    line: u32,
    open_files: Arc<AtomicUsize>,
}

impl Drop for MockValueFile {
    fn drop(&mut self) {
        self.open_files.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockRegistration {
    line: u32,
    readiness: Arc<MockReadiness>,
}

#[derive(Default)]
struct MockReadiness {
    signal: Mutex<Signal>,
    cond: Condvar,
}

#[derive(Default)]
struct Signal {
    pending: bool,
    closed: bool,
    waiters: usize,
}

impl MockReadiness {
    fn raise(&self) {
        let mut signal = self.signal.lock();
        signal.pending = true;
        self.cond.notify_all();
    }
}

enum Node {
    Export,
    Unexport,
    Direction(u32),
    Edge(u32),
    Value(u32),
}

impl Default for MockSysfs {
    fn default() -> Self {
        Self::new(&SysfsConfig::default())
    }
}

impl MockSysfs {
    pub fn new(config: &SysfsConfig) -> Self {
        Self {
            root: config.gpio_root.clone(),
            state: Mutex::new(MockState {
                driver_loaded: true,
                denied: FxHashSet::default(),
                arm_failures: FxHashSet::default(),
                lines: FxHashMap::default(),
                writes: Vec::new(),
                read_offsets: Vec::new(),
                value_opens: 0,
                arms: 0,
                closes: 0,
                live_registrations: 0,
                peak_registrations: 0,
            }),
            open_files: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes exporting `line` fail with a permission error.
    pub fn deny(&self, line: u32) {
        self.state.lock().denied.insert(line);
    }

    /// Makes arming registrations on `line` fail, as when the process is
    /// out of descriptors. Passing `false` lifts it again.
    pub fn fail_arms(&self, line: u32, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.arm_failures.insert(line);
        } else {
            state.arm_failures.remove(&line);
        }
    }

    /// Removes the GPIO class driver: control files disappear.
    pub fn unload_driver(&self) {
        self.state.lock().driver_loaded = false;
    }

    /// Changes the level seen on `line` as external hardware would,
    /// regardless of direction.
    pub fn drive(&self, line: u32, value: Value) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        Self::set_level(&mut state, line, value)
    }

    /// Raises readiness on every registration of `line` without an edge.
    pub fn notify(&self, line: u32) {
        let state = self.state.lock();
        if let Some(l) = state.lines.get(&line) {
            for watcher in &l.watchers {
                watcher.raise();
            }
        }
    }

    /// Removes `line` as if the device vanished. Registrations on it wake up
    /// and every later access fails.
    pub fn unplug(&self, line: u32) {
        let mut state = self.state.lock();
        if let Some(l) = state.lines.remove(&line) {
            for watcher in &l.watchers {
                watcher.raise();
            }
        }
    }

    /// Threads currently parked in `wait` on registrations of `line`.
    pub fn blocked_waiters(&self, line: u32) -> usize {
        let state = self.state.lock();
        state
            .lines
            .get(&line)
            .map(|l| l.watchers.iter().map(|w| w.signal.lock().waiters).sum())
            .unwrap_or(0)
    }

    pub fn is_exported(&self, line: u32) -> bool {
        self.state.lock().lines.contains_key(&line)
    }

    pub fn level(&self, line: u32) -> Option<Value> {
        self.state.lock().lines.get(&line).map(|l| l.value)
    }

    pub fn edge(&self, line: u32) -> Option<EdgeDetect> {
        self.state.lock().lines.get(&line).map(|l| l.edge)
    }

    pub fn direction(&self, line: u32) -> Option<Direction> {
        self.state.lock().lines.get(&line).map(|l| l.direction)
    }

    /// All attribute write attempts in order, including rejected ones.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to<P: AsRef<Path>>(&self, path: P) -> usize {
        let path = path.as_ref();
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    pub fn read_offsets(&self) -> Vec<u64> {
        self.state.lock().read_offsets.clone()
    }

    pub fn value_opens(&self) -> usize {
        self.state.lock().value_opens
    }

    pub fn open_value_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }

    pub fn arm_count(&self) -> usize {
        self.state.lock().arms
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn live_registrations(&self) -> usize {
        self.state.lock().live_registrations
    }

    pub fn peak_registrations(&self) -> usize {
        self.state.lock().peak_registrations
    }

    fn resolve(&self, path: &Path) -> Result<Node, GpioError> {
        let not_found = || GpioError::NotFound(format!("{}", path.display()));
        let relative = path.strip_prefix(&self.root).map_err(|_| not_found())?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str().ok_or_else(not_found),
                _ => Err(not_found()),
            })
            .collect::<Result<_, _>>()?;

        match parts.as_slice() {
            ["export"] => Ok(Node::Export),
            ["unexport"] => Ok(Node::Unexport),
            [dir, attribute] => {
                let line = dir
                    .strip_prefix("gpio")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(not_found)?;
                match *attribute {
                    "direction" => Ok(Node::Direction(line)),
                    "edge" => Ok(Node::Edge(line)),
                    "value" => Ok(Node::Value(line)),
                    _ => Err(not_found()),
                }
            }
            _ => Err(not_found()),
        }
    }

    fn line_mut<'a>(
        state: &'a mut MockState,
        line: u32,
        path: &Path,
    ) -> Result<&'a mut MockLine, GpioError> {
        state
            .lines
            .get_mut(&line)
            .ok_or_else(|| GpioError::NotFound(format!("{}", path.display())))
    }

    fn control_line(state: &MockState, path: &Path, value: &str) -> Result<u32, GpioError> {
        if !state.driver_loaded {
            return Err(GpioError::NotFound(format!("{}", path.display())));
        }
        value
            .trim()
            .parse()
            .map_err(|_| GpioError::Io(format!("{}: invalid argument", path.display())))
    }

    fn set_level(state: &mut MockState, line: u32, value: Value) -> Result<(), GpioError> {
        let l = state
            .lines
            .get_mut(&line)
            .ok_or_else(|| GpioError::NotFound(format!("gpio{line} not exported")))?;
        let old = l.value;
        l.value = value;

        let fires = match l.edge {
            _ if old == value => false,
            EdgeDetect::None => false,
            EdgeDetect::Rising => value == Value::High,
            EdgeDetect::Falling => value == Value::Low,
            EdgeDetect::Both => true,
        };
        if fires {
            for watcher in &l.watchers {
                watcher.raise();
            }
        }
        Ok(())
    }
}

impl SysfsGateway for MockSysfs {
    type ValueFile = MockValueFile;
    type Registration = MockRegistration;

    fn read_attribute(&self, path: &Path) -> Result<String, GpioError> {
        let mut state = self.state.lock();
        let text = match self.resolve(path)? {
            Node::Export | Node::Unexport => {
                return Err(GpioError::PermissionDenied(format!(
                    "{} is write-only",
                    path.display()
                )));
            }
            Node::Direction(line) => Self::line_mut(&mut state, line, path)?
                .direction
                .as_str()
                .to_string(),
            Node::Edge(line) => Self::line_mut(&mut state, line, path)?
                .edge
                .as_str()
                .to_string(),
            Node::Value(line) => Self::line_mut(&mut state, line, path)?.value.to_string(),
        };
        Ok(format!("{text}\n"))
    }

    fn write_attribute(&self, path: &Path, value: &str) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        state.writes.push((path.to_path_buf(), value.to_string()));

        match self.resolve(path)? {
            Node::Export => {
                let line = Self::control_line(&state, path, value)?;
                if state.denied.contains(&line) {
                    return Err(GpioError::PermissionDenied(format!(
                        "{}: export of gpio{line}",
                        path.display()
                    )));
                }
                if state.lines.contains_key(&line) {
                    return Err(GpioError::ResourceBusy(format!(
                        "{}: gpio{line} already exported",
                        path.display()
                    )));
                }
                state.lines.insert(line, MockLine::default());
            }
            Node::Unexport => {
                let line = Self::control_line(&state, path, value)?;
                if state.lines.remove(&line).is_none() {
                    return Err(GpioError::Io(format!(
                        "{}: gpio{line} not exported",
                        path.display()
                    )));
                }
            }
            Node::Direction(line) => {
                Self::line_mut(&mut state, line, path)?.direction = value.parse()?;
            }
            Node::Edge(line) => {
                Self::line_mut(&mut state, line, path)?.edge = value.parse()?;
            }
            Node::Value(line) => {
                if Self::line_mut(&mut state, line, path)?.direction != Direction::Out {
                    return Err(GpioError::PermissionDenied(format!(
                        "{}: line is an input",
                        path.display()
                    )));
                }
                let value = Value::from_ascii(value.trim().bytes().next().unwrap_or(b' '))?;
                Self::set_level(&mut state, line, value)?;
            }
        }
        Ok(())
    }

    fn open_value(&self, path: &Path) -> Result<Self::ValueFile, GpioError> {
        let mut state = self.state.lock();
        let Node::Value(line) = self.resolve(path)? else {
            return Err(GpioError::NotFound(format!("{}", path.display())));
        };
        Self::line_mut(&mut state, line, path)?;
        state.value_opens += 1;
        self.open_files.fetch_add(1, Ordering::SeqCst);
        Ok(MockValueFile {
            line,
            open_files: self.open_files.clone(),
        })
    }

    fn read_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, GpioError> {
        let mut state = self.state.lock();
        state.read_offsets.push(offset);
        let l = state
            .lines
            .get(&file.line)
            .ok_or_else(|| GpioError::Io(format!("gpio{}: no such device", file.line)))?;

        let content = [l.value.as_ascii(), b'\n'];
        let start = (offset as usize).min(content.len());
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }

    fn write_value_at(
        &self,
        file: &Self::ValueFile,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        let l = state
            .lines
            .get(&file.line)
            .ok_or_else(|| GpioError::Io(format!("gpio{}: no such device", file.line)))?;
        if l.direction != Direction::Out {
            return Err(GpioError::PermissionDenied(format!(
                "gpio{}: line is an input",
                file.line
            )));
        }
        if offset != 0 {
            return Err(GpioError::Io(format!(
                "gpio{}: write at offset {offset}",
                file.line
            )));
        }
        let value = Value::from_ascii(buf.first().copied().unwrap_or(b' '))?;
        Self::set_level(&mut state, file.line, value)
    }

    fn arm(&self, file: &Self::ValueFile) -> Result<Self::Registration, GpioError> {
        let mut state = self.state.lock();
        if state.arm_failures.contains(&file.line) {
            return Err(GpioError::Io(format!(
                "gpio{}: too many open files",
                file.line
            )));
        }
        let readiness = Arc::new(MockReadiness::default());
        // the kernel reports the current level once right after arming
        readiness.raise();

        let l = state
            .lines
            .get_mut(&file.line)
            .ok_or_else(|| GpioError::Io(format!("gpio{}: no such device", file.line)))?;
        l.watchers.push(readiness.clone());

        state.arms += 1;
        state.live_registrations += 1;
        state.peak_registrations = state.peak_registrations.max(state.live_registrations);
        Ok(MockRegistration {
            line: file.line,
            readiness,
        })
    }

    fn wait(
        &self,
        registration: &Self::Registration,
        timeout: Option<Duration>,
    ) -> Result<(), GpioError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let readiness = &registration.readiness;
        let mut signal = readiness.signal.lock();
        loop {
            if signal.closed {
                return Err(GpioError::Cancelled);
            }
            if signal.pending {
                signal.pending = false;
                return Ok(());
            }
            signal.waiters += 1;
            let timed_out = match deadline {
                None => {
                    readiness.cond.wait(&mut signal);
                    false
                }
                Some(deadline) => readiness.cond.wait_until(&mut signal, deadline).timed_out(),
            };
            signal.waiters -= 1;
            if timed_out && !signal.pending && !signal.closed {
                return Err(GpioError::Timeout);
            }
        }
    }

    fn close(&self, registration: &Self::Registration) -> Result<(), GpioError> {
        let already_closed = {
            let mut signal = registration.readiness.signal.lock();
            let was = signal.closed;
            signal.closed = true;
            registration.readiness.cond.notify_all();
            was
        };

        let mut state = self.state.lock();
        state.closes += 1;
        if already_closed {
            return Err(GpioError::Io(format!(
                "gpio{}: registration closed twice",
                registration.line
            )));
        }
        state.live_registrations -= 1;
        if let Some(l) = state.lines.get_mut(&registration.line) {
            l.watchers
                .retain(|w| !Arc::ptr_eq(w, &registration.readiness));
        }
        Ok(())
    }
}

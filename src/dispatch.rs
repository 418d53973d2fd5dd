//! Background delivery of edges for one watched pin.
//!
//! Each loop owns one OS thread for its whole life. It blocks on readiness,
//! reads the value that is current at wake-up and hands it to the sink. Two
//! edges closer together than one wake/read/deliver cycle come out as a
//! single value; there is no queue behind the readiness wait.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::GpioError;
use crate::gpio::{EdgeEvent, Pin, SysfsGateway, Value};
use crate::watch::{Watch, wait_for_readiness};

pub(crate) enum Sink {
    Callback(Box<dyn FnMut(Value) + Send>),
    Channel(mpsc::Sender<EdgeEvent>),
}

impl Sink {
    /// Returns false once the consumer is gone.
    fn deliver(&mut self, line: u32, value: Value) -> bool {
        match self {
            Sink::Callback(callback) => {
                callback(value);
                true
            }
            Sink::Channel(tx) => match tx.try_send(EdgeEvent::now(value)) {
                Ok(()) => true,
                Err(TrySendError::Full(event)) => {
                    warn!("gpio{line}: event buffer full, dropping {event:?}");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }
}

pub(crate) struct InterruptDispatcher<G: SysfsGateway> {
    pin: Pin<G>,
    watch: Arc<Watch<G>>,
    sink: Sink,
}

impl<G: SysfsGateway> InterruptDispatcher<G> {
    pub(crate) fn new(pin: Pin<G>, watch: Arc<Watch<G>>, sink: Sink) -> Self {
        Self { pin, watch, sink }
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>, GpioError> {
        let pin = self.pin.clone();
        let watch = self.watch.clone();
        thread::Builder::new()
            .name(format!("gpio{}-edge", pin.line()))
            .spawn(move || self.run())
            .map_err(|e| {
                pin.detach(&watch);
                GpioError::from_io(format!("spawn dispatcher for gpio{}", pin.line()), e)
            })
    }

    fn run(mut self) {
        let line = self.pin.line();
        match self.dispatch() {
            Ok(()) => debug!("gpio{line}: edge dispatcher finished"),
            Err(GpioError::Cancelled) => debug!("gpio{line}: edge dispatcher cancelled"),
            Err(e) => debug!("gpio{line}: edge dispatcher stopped: {e}"),
        }
        self.pin.detach(&self.watch);
    }

    fn dispatch(&mut self) -> Result<(), GpioError> {
        let line = self.pin.line();
        let gateway = Arc::clone(&self.pin.inner.gateway);

        self.watch.prime(&gateway)?;
        loop {
            wait_for_readiness(&*gateway, &self.watch.registration)?;
            let value = self.pin.read_from(&self.watch.file)?;

            let gate = self.watch.gate();
            if !gate.get() {
                return Ok(());
            }
            if !self.sink.deliver(line, value) {
                return Ok(());
            }
        }
    }
}

use core::sync::atomic::{AtomicBool, Ordering::*};
use log::*;

use crate::{
    Error,
    mutex::*,
    bus::Bus,
    parser::{Parser, Handler, AcknowledgeSet, State, Statistics},
    };


/**
    gateway session on the bus

    it owns the bus and the parser, and forwards parser events to its handler. All methods take `&self` so the session can be shared: the bus loop ([Gateway::poll] or [Gateway::service]) is meant to run in one place, while configuration ([Gateway::set_acknowledge], [Gateway::handler]) may come from elsewhere.

    The session starts disconnected, nothing is read from the bus before [Gateway::connect].
*/
pub struct Gateway<B, H> {
    // locks are always taken in field order: handler, control, acknowledge
    handler: BusyMutex<H>,
    control: BusyMutex<Control<B>>,
    acknowledge: BusyMutex<AcknowledgeSet>,
    connected: AtomicBool,
}
struct Control<B> {
    bus: B,
    parser: Parser,
}

impl<B, H> Gateway<B, H> {
    pub fn new(bus: B, handler: H) -> Self {
        Self {
            control: BusyMutex::from(Control {
                bus,
                parser: Parser::new(),
            }),
            handler: BusyMutex::from(handler),
            acknowledge: BusyMutex::from(AcknowledgeSet::new()),
            connected: AtomicBool::new(false),
        }
    }
    /// start or stop answering on behalf of the given address
    pub fn set_acknowledge(&self, address: u16, enabled: bool) -> Result<(), Error> {
        debug!("acknowledge {:#06x}: {}", address, enabled);
        self.acknowledge.lock().set(address, enabled)
    }
    pub fn acknowledges(&self, address: u16) -> bool {
        self.acknowledge.lock().contains(address)
    }
    /// start processing the bus from a clean state
    pub fn connect(&self) {
        if !self.connected.load(Acquire) {
            self.control.lock().parser.reset();
            self.connected.store(true, Release);
            info!("connected");
        }
    }
    pub fn disconnect(&self) {
        if self.connected.swap(false, AcqRel) {
            info!("disconnected");
        }
    }
    pub fn connected(&self) -> bool {
        self.connected.load(Acquire)
    }
    /// exclusive access to the handler, for configuration
    pub fn handler(&self) -> BusyMutexGuard<'_, H> {
        self.handler.lock()
    }
    pub fn statistics(&self) -> Statistics {
        *self.control.lock().parser.statistics()
    }
    pub fn state(&self) -> State {
        self.control.lock().parser.state()
    }
    /// give back the bus and the handler
    pub fn into_parts(self) -> (B, H) {
        (self.control.into_inner().bus, self.handler.into_inner())
    }
}

impl<B: Bus, H: Handler> Gateway<B, H> {
    /// process at most one byte from the bus, never waits for a byte
    pub fn poll(&self) -> Result<(), B::Error> {
        if !self.connected()
            {return Ok(())}
        let mut handler = self.handler.lock();
        let mut control = self.control.lock();
        let Control {bus, parser} = &mut *control;
        if !bus.byte_available()
            {return Ok(())}
        let byte = bus.read_byte()?;
        // copied so that handlers can reconfigure the set
        let acknowledge = self.acknowledge.lock().clone();
        parser.consume(byte, bus, &acknowledge, &mut *handler)
    }
    /**
        true while an exchange is not complete or bytes are waiting

        the bus timings are too tight for the caller to sleep between polls in that case
    */
    pub fn message_still_in_progress(&self) -> bool {
        if !self.connected()
            {return false}
        match self.control.try_lock() {
            Some(mut control) => !control.parser.idle() || control.bus.byte_available(),
            // a poll is running
            None => true,
        }
    }
    /// poll until the current exchange is complete and no byte is waiting
    pub fn service(&self) -> Result<(), B::Error> {
        loop {
            self.poll()?;
            if !self.message_still_in_progress()
                {break Ok(())}
        }
    }
}

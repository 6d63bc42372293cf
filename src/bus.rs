use embedded_io::{Read, Write, ReadReady};
use embedded_hal::{
    digital::{self, OutputPin},
    delay::DelayNs,
    };
use core::convert::Infallible;
use log::*;
use thiserror::Error;


/// settle time of the RS485 transceiver before and after driving the bus
pub const TURNAROUND_MS: u32 = 1;

/**
    byte access to the half-duplex bus

    the parser never blocks on reception: it only reads bytes announced by [Bus::byte_available]. Transmission on the contrary is blocking and always wrapped by [Bus::send] in the direction control envelope.
*/
pub trait Bus {
    type Error: core::fmt::Debug;

    /// true if [Bus::read_byte] can return without waiting
    fn byte_available(&mut self) -> bool;
    fn read_byte(&mut self) -> Result<u8, Self::Error>;
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Self::Error>;
    /// wait until all written bytes left the transmitter
    fn flush(&mut self) -> Result<(), Self::Error>;
    /// drive the transceiver direction pin, nothing to do for transceivers with automatic direction
    fn set_direction(&mut self, _asserted: bool) -> Result<(), Self::Error> {
        Ok(())
    }
    fn delay_ms(&mut self, ms: u32);

    /**
        transmit bytes on the bus

        the transmitter is enabled [TURNAROUND_MS] before the first byte and released [TURNAROUND_MS] after the last byte is flushed. The direction is released even if writing failed.
    */
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.set_direction(true)?;
        self.delay_ms(TURNAROUND_MS);
        let written = self.write_bytes(data).and_then(|_| self.flush());
        self.delay_ms(TURNAROUND_MS);
        let released = self.set_direction(false);
        written.and(released)
    }
}

/// error raised by [HalBus]
#[derive(Error, Debug)]
pub enum BusError<U, P> {
    #[error("uart transfer failed: {0:?}")]
    Uart(U),
    #[error("direction pin failed: {0:?}")]
    Direction(P),
    #[error("uart reached end of stream")]
    Eof,
}

/**
    [Bus] implementation on top of embedded traits

    - `U` is the uart, as provided by most HALs
    - `P` is the transceiver driver-enable pin, use [NoDirection] when the transceiver switches by itself
    - `D` provides the turnaround delays
*/
pub struct HalBus<U, P, D> {
    uart: U,
    direction: P,
    delay: D,
}
impl<U, P, D> HalBus<U, P, D> {
    pub fn new(uart: U, direction: P, delay: D) -> Self {
        Self {uart, direction, delay}
    }
    /// give back the underlying peripherals
    pub fn release(self) -> (U, P, D) {
        (self.uart, self.direction, self.delay)
    }
}
impl<U, P, D> Bus for HalBus<U, P, D>
where
    U: Read + Write + ReadReady,
    P: OutputPin,
    D: DelayNs,
{
    type Error = BusError<U::Error, P::Error>;

    fn byte_available(&mut self) -> bool {
        match self.uart.read_ready() {
            Ok(ready) => ready,
            Err(err) => {
                warn!("cannot poll uart: {:?}", err);
                false
            },
        }
    }
    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        let mut byte = [0];
        match self.uart.read(&mut byte) .map_err(BusError::Uart)? {
            0 => Err(BusError::Eof),
            _ => Ok(byte[0]),
        }
    }
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.uart.write_all(data) .map_err(BusError::Uart)
    }
    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart.flush() .map_err(BusError::Uart)
    }
    fn set_direction(&mut self, asserted: bool) -> Result<(), Self::Error> {
        let result = if asserted  {self.direction.set_high()}
                     else         {self.direction.set_low()};
        result.map_err(BusError::Direction)
    }
    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}

/// direction pin placeholder for transceivers with automatic direction control
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDirection;

impl digital::ErrorType for NoDirection {
    type Error = Infallible;
}
impl OutputPin for NoDirection {
    fn set_low(&mut self) -> Result<(), Self::Error>  {Ok(())}
    fn set_high(&mut self) -> Result<(), Self::Error>  {Ok(())}
}

/*!
    Gateway between the RS485 accessory bus of Nibe heat pumps and the rest of the world.

    The heat pump is the only master on its bus: it polls its accessories by address, sending them tokens they answer with their own frames, and data frames they acknowledge. This crate observes that traffic and may answer on behalf of accessories that are not physically present.

    - [frame] describes the frames and their checksum
    - [bus] abstracts the half-duplex serial line
    - [parser] follows exchanges byte by byte and answers for impersonated accessories
    - [gateway] wraps the parser in a session shareable between threads
    - `multiplexer` and `targets` (feature `std`) route responses queued by clients and distribute the observed frames
*/
#![no_std]
#[cfg(feature = "std")]
extern crate std;

mod mutex;

pub mod frame;
pub mod bus;
pub mod parser;
pub mod gateway;
#[cfg(feature = "std")]
pub mod multiplexer;
#[cfg(feature = "std")]
pub mod targets;

pub use frame::{Frame, FrameError, Token};
pub use bus::{Bus, BusError, HalBus};
pub use parser::{Parser, Handler, Callbacks, AcknowledgeSet, Fault, Statistics};
pub use gateway::Gateway;
pub use mutex::BusyMutexGuard;
#[cfg(feature = "std")]
pub use multiplexer::Multiplexer;
#[cfg(feature = "std")]
pub use targets::Targets;

/// errors of the gateway configuration
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("payload is longer than the maximum frame")]
    TooLong,
    #[error("no room left for another impersonated address")]
    AcknowledgeFull,
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("source is not allowed to submit requests")]
    Source,
}

/*!
    incremental parser and responder for the nibe bus

    The [Parser] consumes the bus one byte at a time and follows whole exchanges: a master frame, the reply of the addressed accessory if any, then the acknowledge byte. Every exchange ends in [State::WaitStart] and its complete transcript is given to [Handler::on_frame].

    When the addressed accessory is impersonated (listed in the [AcknowledgeSet]), the parser answers on its behalf: a token is answered with the response filled by [Handler::on_token] or with a plain ACK, a data frame is acknowledged.
*/

use log::*;

use crate::{
    Error,
    bus::Bus,
    frame::{self, Frame, MasterHeader, SlaveHeader, MAX_FRAME, MAX_MASTER_DATA, MAX_SLAVE_DATA, MASTER_START, SLAVE_START, ACK, NAK},
    };


/// capacity of the transcript: a master frame, a slave frame and an acknowledge byte
pub const TRANSCRIPT: usize = 2*MAX_FRAME + 1;
/// maximum number of impersonated addresses
pub const MAX_ACKNOWLEDGE: usize = 16;

/// bytes of one exchange, as they appeared on the bus
pub type Transcript = heapless::Vec<u8, TRANSCRIPT>;

/// parser position in the current exchange
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum State {
    /// idle, looking for a master start byte
    #[default]
    WaitStart,
    /// a token to a real accessory was seen, waiting for its reply
    WaitStartSlave,
    /// receiving a master frame
    WaitData,
    /// receiving the reply of a real accessory
    WaitDataSlave,
    /// waiting for the byte acknowledging the last frame
    WaitAck,
}

/// recoverable protocol faults, they are only logged and counted
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    #[error("frame with an impossible length")]
    MalformedFrame,
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
    #[error("exchange exceeds the transcript buffer")]
    BufferOverflow,
    #[error("unexpected byte instead of acknowledge")]
    UnexpectedAckByte,
}

/// counters of the parser activity since its creation
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// valid master frames received
    pub frames: u32,
    /// transcripts delivered to the handler
    pub exchanges: u32,
    /// responses transmitted on behalf of impersonated accessories
    pub responses: u32,
    pub acks: u32,
    pub naks: u32,
    pub malformed: u32,
    pub checksum: u32,
    pub overflow: u32,
    pub unexpected: u32,
}
impl Statistics {
    fn count(&mut self, fault: Fault) {
        let counter = match fault {
            Fault::MalformedFrame => &mut self.malformed,
            Fault::ChecksumMismatch => &mut self.checksum,
            Fault::BufferOverflow => &mut self.overflow,
            Fault::UnexpectedAckByte => &mut self.unexpected,
        };
        *counter = counter.wrapping_add(1);
    }
    /// total number of faults of all kinds
    pub fn faults(&self) -> u32 {
        self.malformed
            .wrapping_add(self.checksum)
            .wrapping_add(self.overflow)
            .wrapping_add(self.unexpected)
    }
}

/// receiver of the parser events
pub trait Handler {
    /// an exchange is complete, or was aborted, `transcript` holds all its bytes
    fn on_frame(&mut self, transcript: &[u8]);
    /**
        an impersonated accessory received a token

        `response` is empty on call, the handler may fill it with a complete slave frame to transmit. If left empty, the token is simply acknowledged.
    */
    fn on_token(&mut self, address: u16, command: u8, response: &mut Frame);
}
impl<H: Handler + ?Sized> Handler for &mut H {
    fn on_frame(&mut self, transcript: &[u8]) {
        (**self).on_frame(transcript)
    }
    fn on_token(&mut self, address: u16, command: u8, response: &mut Frame) {
        (**self).on_token(address, command, response)
    }
}

/// [Handler] made of two closures
pub struct Callbacks<R, T> {
    pub received: R,
    pub token: T,
}
impl<R, T> Handler for Callbacks<R, T>
where
    R: FnMut(&[u8]),
    T: FnMut(u16, u8, &mut Frame),
{
    fn on_frame(&mut self, transcript: &[u8]) {
        (self.received)(transcript)
    }
    fn on_token(&mut self, address: u16, command: u8, response: &mut Frame) {
        (self.token)(address, command, response)
    }
}

/// addresses of the accessories impersonated by the gateway
#[derive(Clone, Debug, Default)]
pub struct AcknowledgeSet {
    addresses: heapless::Vec<u16, MAX_ACKNOWLEDGE>,
}
impl AcknowledgeSet {
    pub fn new() -> Self {
        Self::default()
    }
    /// start or stop impersonating the given address
    pub fn set(&mut self, address: u16, enabled: bool) -> Result<(), Error> {
        let position = self.addresses.iter().position(|&a| a == address);
        match (position, enabled) {
            (None, true) => self.addresses.push(address) .map_err(|_| Error::AcknowledgeFull)?,
            (Some(index), false) => {self.addresses.swap_remove(index);},
            _ => {},
        }
        Ok(())
    }
    pub fn contains(&self, address: u16) -> bool {
        self.addresses.contains(&address)
    }
    pub fn iter(&self) -> impl Iterator<Item=u16> + '_ {
        self.addresses.iter().copied()
    }
}


/// bus state machine, see module documentation
pub struct Parser {
    state: State,
    /// bytes of the current exchange
    transcript: Transcript,
    /// start of the slave frame in transcript
    slave: usize,
    /// last byte seen while waiting for a frame start
    previous: u8,
    /// response to transmit for an impersonated accessory
    response: Frame,
    statistics: Statistics,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub const fn new() -> Self {
        Self {
            state: State::WaitStart,
            transcript: Transcript::new(),
            slave: 0,
            previous: 0,
            response: Frame::new(),
            statistics: Statistics {
                frames: 0,
                exchanges: 0,
                responses: 0,
                acks: 0,
                naks: 0,
                malformed: 0,
                checksum: 0,
                overflow: 0,
                unexpected: 0,
            },
        }
    }
    pub fn state(&self) -> State  {self.state}
    /// number of bytes accumulated in the current exchange
    pub fn cursor(&self) -> usize  {self.transcript.len()}
    pub fn transcript(&self) -> &[u8]  {&self.transcript}
    pub fn statistics(&self) -> &Statistics  {&self.statistics}
    /// true when no exchange is in progress
    pub fn idle(&self) -> bool  {self.state == State::WaitStart}

    /// drop the current exchange without reporting it
    pub fn reset(&mut self) {
        self.state = State::WaitStart;
        self.transcript.clear();
        self.slave = 0;
        self.previous = 0;
    }

    /**
        process one byte received from the bus

        this may transmit on the bus and call the handler before returning. A transport error aborts the current exchange and is returned, the parser is then ready for a new exchange.
    */
    pub fn consume<B: Bus, H: Handler>(&mut self, byte: u8, bus: &mut B, acknowledge: &AcknowledgeSet, handler: &mut H) -> Result<(), B::Error> {
        trace!("{:02X} {:?}", byte, self.state);
        if self.state == State::WaitStart {
            self.wait_start(byte);
            return Ok(());
        }
        if self.transcript.push(byte).is_err() {
            warn!("exchange exceeds {} bytes, dropping it", TRANSCRIPT);
            self.fault(Fault::BufferOverflow);
            self.complete(handler, 0);
            self.wait_start(byte);
            return Ok(());
        }
        let result = match self.state {
            State::WaitStart => Ok(()),
            State::WaitData => self.wait_data(bus, acknowledge, handler),
            State::WaitStartSlave => {
                if byte == SLAVE_START {
                    self.slave = self.transcript.len() - 1;
                    self.state = State::WaitDataSlave;
                }
                else {
                    // some accessories answer a token with a bare acknowledge
                    self.wait_ack(byte, handler);
                }
                Ok(())
            },
            State::WaitDataSlave => {
                self.wait_data_slave(handler);
                Ok(())
            },
            State::WaitAck => {
                self.wait_ack(byte, handler);
                Ok(())
            },
        };
        if let Err(err) = &result {
            warn!("transmission failed, aborting exchange: {:?}", err);
            self.reset();
        }
        result
    }

    fn wait_start(&mut self, byte: u8) {
        if self.previous == MASTER_START {
            if byte == MASTER_START {
                // doubled start byte, keep only one
                trace!("doubled start byte");
                return;
            }
            self.transcript.clear();
            if self.transcript.extend_from_slice(&[MASTER_START, byte]).is_ok() {
                debug!("frame start found");
                self.state = State::WaitData;
            }
            self.previous = 0;
        }
        else {
            self.previous = byte;
        }
    }

    fn wait_data<B: Bus, H: Handler>(&mut self, bus: &mut B, acknowledge: &AcknowledgeSet, handler: &mut H) -> Result<(), B::Error> {
        let Some(header) = MasterHeader::decode(&self.transcript)
            else {return Ok(())};
        if usize::from(header.length) > MAX_MASTER_DATA {
            debug!("impossible frame length {}", header.length);
            self.fault(Fault::MalformedFrame);
            self.complete(handler, 0);
            return Ok(());
        }
        let size = header.frame_size();
        if self.transcript.len() < size
            {return Ok(())}

        let impersonated = acknowledge.contains(header.address);
        // start byte is not covered by master checksum
        let valid = frame::verify(&self.transcript[1 .. size-1], self.transcript[size-1]);
        if !valid {
            warn!("checksum mismatch in frame to {:#06x}", header.address);
            self.fault(Fault::ChecksumMismatch);
            if impersonated {
                return self.reply(bus, handler, NAK);
            }
            self.complete(handler, 0);
            return Ok(());
        }
        self.statistics.frames = self.statistics.frames.wrapping_add(1);
        debug!("frame to {:#06x} command {:?} with {} bytes", header.address, header.token(), header.length);

        if impersonated {
            if header.length == 0 {
                self.response.clear();
                handler.on_token(header.address, header.command, &mut self.response);
                if self.response.is_empty() {
                    debug!("nothing to send to {:#06x}", header.address);
                    return self.reply(bus, handler, ACK);
                }
                debug!("send {} bytes to {:#06x}", self.response.len(), header.address);
                bus.send(&self.response)?;
                self.statistics.responses = self.statistics.responses.wrapping_add(1);
                self.slave = self.transcript.len();
                if self.transcript.extend_from_slice(&self.response).is_err() {
                    warn!("response does not fit in transcript");
                }
                // the heat pump acknowledges our response
                self.state = State::WaitAck;
                Ok(())
            }
            else {
                self.reply(bus, handler, ACK)
            }
        }
        else if header.length == 0 {
            self.state = State::WaitStartSlave;
            Ok(())
        }
        else {
            self.state = State::WaitAck;
            Ok(())
        }
    }

    fn wait_data_slave<H: Handler>(&mut self, handler: &mut H) {
        let Some(header) = SlaveHeader::decode(&self.transcript[self.slave ..])
            else {return};
        if usize::from(header.length) > MAX_SLAVE_DATA {
            debug!("impossible reply length {}", header.length);
            self.fault(Fault::MalformedFrame);
            self.complete(handler, 0);
            return;
        }
        let end = self.slave + header.frame_size();
        if self.transcript.len() < end
            {return}

        let reply = &self.transcript[self.slave .. end];
        let (content, sum) = reply.split_at(reply.len() - 1);
        if !frame::verify(content, sum[0]) {
            // only observing, the heat pump decides
            warn!("checksum mismatch in reply to command {:#04x}", header.command);
            self.fault(Fault::ChecksumMismatch);
        }
        self.state = State::WaitAck;
    }

    fn wait_ack<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        match byte {
            ACK => {
                debug!("ack received");
                self.complete(handler, 0);
            },
            NAK => {
                debug!("nak received");
                self.complete(handler, 0);
            },
            MASTER_START => {
                // a new frame begins, it is not part of this exchange
                debug!("frame start before acknowledge");
                self.transcript.pop();
                self.complete(handler, MASTER_START);
            },
            _ => {
                warn!("unexpected byte {:02X} instead of acknowledge", byte);
                self.fault(Fault::UnexpectedAckByte);
                self.complete(handler, 0);
            },
        }
    }

    /// transmit an acknowledge byte and terminate the exchange
    fn reply<B: Bus, H: Handler>(&mut self, bus: &mut B, handler: &mut H, byte: u8) -> Result<(), B::Error> {
        bus.send(&[byte])?;
        if byte == ACK  {self.statistics.acks = self.statistics.acks.wrapping_add(1)}
        else            {self.statistics.naks = self.statistics.naks.wrapping_add(1)}
        if self.transcript.push(byte).is_err() {
            warn!("acknowledge does not fit in transcript");
        }
        self.complete(handler, 0);
        Ok(())
    }

    /// report the exchange and get back to idle, `trailing` is considered already received in the new state
    fn complete<H: Handler>(&mut self, handler: &mut H, trailing: u8) {
        handler.on_frame(&self.transcript);
        self.statistics.exchanges = self.statistics.exchanges.wrapping_add(1);
        self.state = State::WaitStart;
        self.transcript.clear();
        self.slave = 0;
        self.previous = trailing;
    }

    fn fault(&mut self, fault: Fault) {
        debug!("{}", fault);
        self.statistics.count(fault);
    }
}

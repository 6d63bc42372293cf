/*!
    nibe bus wire format

    master frame, sent by the heat pump:

    ```text
    | 5C | ADDR_HI | ADDR_LO | CMD | LEN | DATA ... | CHK |
         |------------- CHK ---------------|
    ```

    slave frame, sent by an accessory answering a token:

    ```text
    | C0 | CMD | LEN | DATA ... | CHK |
    |---------- CHK ----------|
    ```

    a frame is confirmed by a single ACK or NAK byte from the receiving party.
*/

use bilge::prelude::*;
use packbytes::{FromBytes, ToBytes, ByteArray};
use thiserror::Error;


/// first byte of any frame sent by the heat pump
pub const MASTER_START: u8 = 0x5C;
/// first byte of a frame sent by an accessory
pub const SLAVE_START: u8 = 0xC0;
/// frame received and accepted
pub const ACK: u8 = 0x06;
/// frame received but rejected
pub const NAK: u8 = 0x15;
/// checksum transmitted by the heat pump instead of a checksum that would equal [MASTER_START]
pub const CHECKSUM_SUBSTITUTE: u8 = 0xC5;

/// maximum size of a complete frame on the bus
pub const MAX_FRAME: usize = 128;
/// maximum data size in a master frame (header and checksum excluded)
pub const MAX_MASTER_DATA: usize = MAX_FRAME - 6;
/// maximum data size in a slave frame (header and checksum excluded)
pub const MAX_SLAVE_DATA: usize = MAX_FRAME - 4;

/// a complete frame, or the response to transmit in place of an impersonated device
pub type Frame = heapless::Vec<u8, MAX_FRAME>;

/// bus addresses of known accessories
pub mod address {
    pub const AXC40: u16 = 0x05;
    pub const SMS40: u16 = 0x16;
    pub const RMU40_S1: u16 = 0x19;
    pub const RMU40_S2: u16 = 0x1A;
    pub const RMU40_S3: u16 = 0x1B;
    pub const RMU40_S4: u16 = 0x1C;
    pub const MODBUS40: u16 = 0x20;
    pub const DEH500: u16 = 0x27;
    pub const EME20: u16 = 0xA4;
}

/// known command bytes exchanged with accessories
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, Debug, PartialEq)]
pub enum Token {
    /// heat pump asks the modbus accessory for a pending read request
    ModbusRead = 0x69,
    /// heat pump asks the modbus accessory for a pending write request
    ModbusWrite = 0x6B,
    /// heat pump asks a room unit for pending writes
    RmuWrite = 0x60,
    /// heat pump pushes its status to a room unit
    RmuDataMsg = 0x62,
    /// heat pump asks a room unit for its data
    RmuData = 0x63,
    Accessory = 0xEE,
    #[fallback]
    Unknown = 0xFF,
}

/// header of a frame sent by the heat pump
#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default, PartialEq)]
pub struct MasterHeader {
    /// always [MASTER_START]
    pub start: u8,
    /// accessory the frame is addressed to
    pub address: u16,
    pub command: u8,
    /// number of data bytes following this header
    pub length: u8,
}
/// header of a frame sent by an accessory
#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default, PartialEq)]
pub struct SlaveHeader {
    /// always [SLAVE_START]
    pub start: u8,
    pub command: u8,
    /// number of data bytes following this header
    pub length: u8,
}

impl MasterHeader {
    pub const SIZE: usize = <Self as FromBytes>::Bytes::SIZE;

    /// decode the header at the beginning of `data`, if long enough
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut bytes = <Self as FromBytes>::Bytes::zeroed();
        bytes.as_mut().copy_from_slice(data.get(.. Self::SIZE)?);
        Some(Self::from_be_bytes(bytes))
    }
    /// size of the complete frame announced by this header
    pub fn frame_size(&self) -> usize {
        Self::SIZE + usize::from(self.length) + 1
    }
    pub fn token(&self) -> Token {
        Token::from(self.command)
    }
}
impl SlaveHeader {
    pub const SIZE: usize = <Self as FromBytes>::Bytes::SIZE;

    /// decode the header at the beginning of `data`, if long enough
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut bytes = <Self as FromBytes>::Bytes::zeroed();
        bytes.as_mut().copy_from_slice(data.get(.. Self::SIZE)?);
        Some(Self::from_be_bytes(bytes))
    }
    /// size of the complete frame announced by this header
    pub fn frame_size(&self) -> usize {
        Self::SIZE + usize::from(self.length) + 1
    }
}

/// reason for rejecting a frame
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame does not begin with the expected start byte")]
    Start,
    #[error("frame length does not match its header or exceeds the maximum frame")]
    Length,
    #[error("frame checksum mismatch")]
    Checksum,
}


/**
    xor checksum of the given bytes

    the heat pump never transmits [MASTER_START] as checksum since it would be taken for a frame start, it sends [CHECKSUM_SUBSTITUTE] instead. This function applies the same substitution so its result can be compared to received checksums or transmitted as is.
*/
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0, |sum, byte| sum ^ byte);
    if sum == MASTER_START  {CHECKSUM_SUBSTITUTE}
    else {sum}
}
/// check a received checksum against the given bytes
pub fn verify(data: &[u8], received: u8) -> bool {
    received == checksum(data)
}

/// build a complete master frame
pub fn master_frame(address: u16, command: u8, data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() > MAX_MASTER_DATA
        {return Err(FrameError::Length)}
    let header = MasterHeader {
        start: MASTER_START,
        address,
        command,
        length: u8::try_from(data.len()) .map_err(|_| FrameError::Length)?,
        };
    let mut frame = Frame::new();
    frame.extend_from_slice(header.to_be_bytes().as_ref()) .map_err(|_| FrameError::Length)?;
    frame.extend_from_slice(data) .map_err(|_| FrameError::Length)?;
    // start byte is not covered by master checksum
    let sum = checksum(&frame[1 ..]);
    frame.push(sum) .map_err(|_| FrameError::Length)?;
    Ok(frame)
}

/// build a complete slave frame, as an accessory answers a token
pub fn response_frame(command: u8, data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() > MAX_SLAVE_DATA
        {return Err(FrameError::Length)}
    let header = SlaveHeader {
        start: SLAVE_START,
        command,
        length: u8::try_from(data.len()) .map_err(|_| FrameError::Length)?,
        };
    let mut frame = Frame::new();
    frame.extend_from_slice(header.to_be_bytes().as_ref()) .map_err(|_| FrameError::Length)?;
    frame.extend_from_slice(data) .map_err(|_| FrameError::Length)?;
    let sum = checksum(&frame);
    frame.push(sum) .map_err(|_| FrameError::Length)?;
    Ok(frame)
}

/// check that the given bytes are exactly one well formed slave frame
pub fn check_response(frame: &[u8]) -> Result<(), FrameError> {
    if frame.first() != Some(&SLAVE_START)
        {return Err(FrameError::Start)}
    let header = SlaveHeader::decode(frame) .ok_or(FrameError::Length)?;
    if frame.len() != header.frame_size() || frame.len() > MAX_FRAME
        {return Err(FrameError::Length)}
    let (content, sum) = frame.split_at(frame.len() - 1);
    if !verify(content, sum[0])
        {return Err(FrameError::Checksum)}
    Ok(())
}

/**
    collapse doubled start bytes in received data

    the bus doubles a [MASTER_START] appearing in frame data, each such pair is reduced to one byte. A single occurrence passes unchanged.
*/
pub fn deduplicate(data: &[u8]) -> impl Iterator<Item=u8> + '_ {
    let mut skip = false;
    data.iter().enumerate().filter_map(move |(i, &byte)| {
        if skip {
            skip = false;
            return None;
        }
        if byte == MASTER_START && data.get(i+1) == Some(&MASTER_START) {
            skip = true;
        }
        Some(byte)
    })
}

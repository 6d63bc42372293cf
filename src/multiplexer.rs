/*!
    request multiplexing for impersonated accessories

    The [Multiplexer] is the [Handler] of a gateway impersonating accessories. It decides what to answer to each token, and distributes the exchanges observed on the bus.

    - responses are looked up by (address, token): a queued response first, each one sent once, then a constant response or a provider function
    - listeners registered by (address, command) receive the data of every valid master frame matching the key, impersonated or not
    - observers receive every raw transcript, they typically forward it to the [Targets]
*/

use std::{
    boxed::Box,
    vec::Vec,
    collections::{BTreeMap, VecDeque},
    net::{IpAddr, SocketAddr},
    time::Duration,
    };
use log::*;

use crate::{
    Error,
    frame::{self, Frame, MasterHeader, MAX_FRAME, MASTER_START},
    parser::Handler,
    targets::Targets,
    };


/// maximum number of queued responses per key
pub const DEFAULT_DEPTH: usize = 3;
/// idle time after which a refreshed target is forgotten
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(60);

/// accessory address and token
pub type RequestKey = (u16, u8);
/// produces a response on demand
pub type Provider = Box<dyn FnMut() -> Option<Vec<u8>> + Send>;
/// receives the deduplicated data of a master frame
pub type Listener = Box<dyn FnMut(&[u8]) + Send>;
/// receives raw transcripts
pub type Observer = Box<dyn FnMut(&[u8]) + Send>;

/// response used when nothing is queued
enum Fallback {
    Constant(Vec<u8>),
    Provider(Provider),
}
#[derive(Default)]
struct Request {
    queue: VecDeque<Vec<u8>>,
    fallback: Option<Fallback>,
}

pub struct Multiplexer {
    depth: usize,
    requests: BTreeMap<RequestKey, Request>,
    listeners: BTreeMap<RequestKey, Vec<Listener>>,
    observers: Vec<Observer>,
    targets: Targets,
    /// hosts allowed to submit requests, any host if empty
    sources: Vec<IpAddr>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH, DEFAULT_TARGET_TIMEOUT)
    }
}

impl Multiplexer {
    /// `depth` bounds each response queue, `timeout` applies to refreshed targets
    pub fn new(depth: usize, timeout: Duration) -> Self {
        Self {
            depth: depth.max(1),
            requests: BTreeMap::new(),
            listeners: BTreeMap::new(),
            observers: Vec::new(),
            targets: Targets::new(timeout),
            sources: Vec::new(),
        }
    }

    /**
        queue a response for the next token to `address`

        when the queue is full, its oldest response is dropped
    */
    pub fn enqueue(&mut self, address: u16, token: u8, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME
            {return Err(Error::TooLong)}
        let depth = self.depth;
        let queue = &mut self.requests.entry((address, token)).or_default().queue;
        while queue.len() >= depth {
            queue.pop_front();
            warn!("dropping oldest response queued for {:#06x} token {:#04x}", address, token);
        }
        queue.push_back(payload);
        debug!("queued response for {:#06x} token {:#04x}, {} pending", address, token, queue.len());
        Ok(())
    }
    /**
        queue a response submitted by a network client

        the client must be an allowed source and the response a well formed slave frame. The client then receives the bus traffic as a target.
    */
    pub fn enqueue_from(&mut self, source: SocketAddr, address: u16, token: u8, payload: &[u8]) -> Result<(), Error> {
        if !self.sources.is_empty() && !self.sources.contains(&source.ip()) {
            warn!("request from {} ignored", source);
            return Err(Error::Source);
        }
        frame::check_response(payload)?;
        self.targets.refresh(source);
        self.enqueue(address, token, payload)
    }
    /// response sent when nothing is queued
    pub fn set_constant(&mut self, address: u16, token: u8, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME
            {return Err(Error::TooLong)}
        self.requests.entry((address, token)).or_default().fallback = Some(Fallback::Constant(payload));
        Ok(())
    }
    /// function producing the response when nothing is queued
    pub fn set_provider(&mut self, address: u16, token: u8, provider: impl FnMut() -> Option<Vec<u8>> + Send + 'static) {
        self.requests.entry((address, token)).or_default().fallback = Some(Fallback::Provider(Box::new(provider)));
    }
    /// forget queued responses and fallback for this key
    pub fn clear(&mut self, address: u16, token: u8) {
        self.requests.remove(&(address, token));
    }
    /// number of queued responses for this key
    pub fn pending(&self, address: u16, token: u8) -> usize {
        self.requests.get(&(address, token))
            .map_or(0, |request| request.queue.len())
    }

    /**
        response to a token received by `address`

        `None` means nothing to send, the token is then only acknowledged
    */
    pub fn on_token_poll(&mut self, address: u16, token: u8) -> Option<Vec<u8>> {
        let request = self.requests.get_mut(&(address, token))?;
        if let Some(payload) = request.queue.pop_front() {
            debug!("queued response to {:#06x} token {:#04x}: {} bytes", address, token, payload.len());
            return Some(payload);
        }
        match request.fallback.as_mut()? {
            Fallback::Constant(payload) => {
                debug!("constant response to {:#06x} token {:#04x}: {} bytes", address, token, payload.len());
                Some(payload.clone())
            },
            Fallback::Provider(provider) => provider(),
        }
    }

    /// call `listener` with the data of every master frame to `address` with `command`
    pub fn add_listener(&mut self, address: u16, command: u8, listener: impl FnMut(&[u8]) + Send + 'static) {
        self.listeners.entry((address, command)).or_default().push(Box::new(listener));
    }
    /// call `observer` with every transcript from the bus
    pub fn on_frame_received(&mut self, observer: impl FnMut(&[u8]) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// restrict network submissions to the given hosts
    pub fn add_source(&mut self, source: IpAddr) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }
    pub fn sources(&self) -> &[IpAddr]  {&self.sources}
    pub fn targets(&self) -> &Targets  {&self.targets}
    pub fn targets_mut(&mut self) -> &mut Targets  {&mut self.targets}

    /// deliver a valid master frame at the beginning of the transcript to its listeners
    fn dispatch(&mut self, transcript: &[u8]) {
        let Some(header) = MasterHeader::decode(transcript)
            else {return};
        let size = header.frame_size();
        if header.start != MASTER_START || transcript.len() < size
            {return}
        if !frame::verify(&transcript[1 .. size-1], transcript[size-1])
            {return}
        let Some(listeners) = self.listeners.get_mut(&(header.address, header.command))
            else {return};
        let data = frame::deduplicate(&transcript[MasterHeader::SIZE .. size-1]).collect::<Vec<u8>>();
        for listener in listeners {
            listener(&data);
        }
    }
}

impl Handler for Multiplexer {
    fn on_frame(&mut self, transcript: &[u8]) {
        for observer in &mut self.observers {
            observer(transcript);
        }
        self.dispatch(transcript);
    }
    fn on_token(&mut self, address: u16, command: u8, response: &mut Frame) {
        let Some(payload) = self.on_token_poll(address, command)
            else {return};
        if response.extend_from_slice(&payload).is_err() {
            warn!("response of {} bytes to {:#06x} is too long, not sent", payload.len(), address);
            response.clear();
        }
    }
}

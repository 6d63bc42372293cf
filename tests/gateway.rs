use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, mpsc},
    };

use nibegw::{
    Gateway, Multiplexer, Bus,
    frame::{self, address, Token, ACK, NAK},
    parser::State,
    };


/// bus fed from memory, recording everything sent
#[derive(Default)]
struct Wire {
    input: VecDeque<u8>,
    sent: Vec<u8>,
    transmissions: usize,
}
impl Wire {
    fn new(exchanges: &[&[u8]]) -> Self {
        Self {
            input: exchanges.concat().into(),
            .. Default::default()
        }
    }
}
impl Bus for Wire {
    type Error = &'static str;
    fn byte_available(&mut self) -> bool  {!self.input.is_empty()}
    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        self.input.pop_front() .ok_or("nothing to read")
    }
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.sent.extend_from_slice(data);
        Ok(())
    }
    fn flush(&mut self) -> Result<(), Self::Error>  {Ok(())}
    fn set_direction(&mut self, asserted: bool) -> Result<(), Self::Error> {
        if asserted {
            self.transmissions += 1;
        }
        Ok(())
    }
    fn delay_ms(&mut self, _ms: u32) {}
}

const ACKNOWLEDGE: &[u8] = &[ACK];

type Records = Arc<Mutex<Vec<Vec<u8>>>>;

fn test<T>(exchanges: &[&[u8]], test: T) -> Wire
where T: FnOnce(&Gateway<Wire, Multiplexer>)
{
    let _ = env_logger::builder().is_test(true).try_init();
    let gateway = Gateway::new(Wire::new(exchanges), Multiplexer::default());
    gateway.connect();
    test(&gateway);
    assert!(!gateway.message_still_in_progress());
    assert_eq!(gateway.state(), State::WaitStart);
    gateway.into_parts().0
}

fn record(records: &Records) -> impl FnMut(&[u8]) + Send + 'static {
    let records = records.clone();
    move |data: &[u8]| records.lock().unwrap().push(data.to_vec())
}


#[test]
fn modbus_read_answered() {
    let token = frame::master_frame(address::MODBUS40, Token::ModbusRead.into(), &[]).unwrap();
    let response = frame::response_frame(Token::ModbusRead.into(), &[0x01, 0x9C, 0x40, 0x00]).unwrap();

    let wire = test(&[token.as_slice(), ACKNOWLEDGE, token.as_slice()], |gateway| {
        gateway.set_acknowledge(address::MODBUS40, true).unwrap();
        gateway.handler().enqueue(address::MODBUS40, Token::ModbusRead.into(), response.to_vec()).unwrap();
        gateway.service().unwrap();

        let statistics = gateway.statistics();
        assert_eq!(statistics.frames, 2);
        assert_eq!(statistics.exchanges, 2);
        assert_eq!(statistics.responses, 1);
        assert_eq!(statistics.acks, 1);
        assert_eq!(statistics.faults(), 0);
        assert_eq!(gateway.handler().pending(address::MODBUS40, Token::ModbusRead.into()), 0);
    });
    // the queued response first, then a bare acknowledge since nothing is left
    assert_eq!(wire.sent, [response.as_slice(), ACKNOWLEDGE].concat());
    assert_eq!(wire.transmissions, 2);
}

#[test]
fn corrupted_frame_refused() {
    let mut write = frame::master_frame(address::RMU40_S1, Token::RmuWrite.into(), &[0x06, 0x01, 0x02]).unwrap();
    let last = write.len() - 1;
    write[last] ^= 0x01;

    let wire = test(&[write.as_slice()], |gateway| {
        gateway.set_acknowledge(address::RMU40_S1, true).unwrap();
        gateway.service().unwrap();

        let statistics = gateway.statistics();
        assert_eq!(statistics.checksum, 1);
        assert_eq!(statistics.naks, 1);
        assert_eq!(statistics.frames, 0);
    });
    assert_eq!(wire.sent, [NAK]);
}

#[test]
fn observe_real_accessory() {
    let data = frame::master_frame(address::RMU40_S1, Token::RmuDataMsg.into(), &[0x01, 0x5C, 0x5C, 0x02]).unwrap();
    let token = frame::master_frame(address::RMU40_S1, Token::RmuData.into(), &[]).unwrap();
    let reply = frame::response_frame(Token::RmuData.into(), &[0x11, 0x22]).unwrap();

    let transcripts = Records::default();
    let messages = Records::default();
    let wire = test(&[data.as_slice(), ACKNOWLEDGE, token.as_slice(), reply.as_slice(), ACKNOWLEDGE], |gateway| {
        {
            let mut multiplexer = gateway.handler();
            multiplexer.on_frame_received(record(&transcripts));
            multiplexer.add_listener(address::RMU40_S1, Token::RmuDataMsg.into(), record(&messages));
        }
        gateway.service().unwrap();
        assert_eq!(gateway.statistics().exchanges, 2);
        assert_eq!(gateway.statistics().faults(), 0);
    });
    // only observing
    assert!(wire.sent.is_empty());

    assert_eq!(*transcripts.lock().unwrap(), [
        [data.as_slice(), ACKNOWLEDGE].concat(),
        [token.as_slice(), reply.as_slice(), ACKNOWLEDGE].concat(),
        ]);
    assert_eq!(*messages.lock().unwrap(), [vec![0x01, 0x5C, 0x02]]);
}

#[test]
fn client_requests() {
    let token = frame::master_frame(address::MODBUS40, Token::ModbusWrite.into(), &[]).unwrap();
    let response = frame::response_frame(Token::ModbusWrite.into(), &[0x01, 0x02, 0x03]).unwrap();
    let client = SocketAddr::from(([192, 168, 0, 40], 10090));
    let intruder = SocketAddr::from(([192, 168, 0, 66], 10090));

    let wire = test(&[token.as_slice(), ACKNOWLEDGE], |gateway| {
        gateway.set_acknowledge(address::MODBUS40, true).unwrap();
        {
            let mut multiplexer = gateway.handler();
            multiplexer.add_source(IpAddr::from([192, 168, 0, 40]));
            assert!(multiplexer.enqueue_from(intruder, address::MODBUS40, Token::ModbusWrite.into(), &response).is_err());
            multiplexer.enqueue_from(client, address::MODBUS40, Token::ModbusWrite.into(), &response).unwrap();
            assert_eq!(multiplexer.targets().iter().collect::<Vec<_>>(), [client]);
        }
        gateway.service().unwrap();
    });
    assert_eq!(wire.sent, response.as_slice());
}

#[test]
fn configured_from_another_thread() {
    let token = frame::master_frame(address::RMU40_S2, Token::RmuData.into(), &[]).unwrap();
    let response = frame::response_frame(Token::RmuData.into(), &[0x42]).unwrap();

    let payload = response.to_vec();

    let wire = test(&[token.as_slice(), ACKNOWLEDGE], |gateway| {
        let (ready, configured) = mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                gateway.set_acknowledge(address::RMU40_S2, true).unwrap();
                gateway.handler().set_constant(address::RMU40_S2, Token::RmuData.into(), payload).unwrap();
                ready.send(()).unwrap();
            });
            scope.spawn(move || {
                configured.recv().unwrap();
                gateway.service().unwrap();
            });
        });
        assert_eq!(gateway.statistics().responses, 1);
    });
    assert_eq!(wire.sent, response.as_slice());
}

#[test]
fn configured_while_polling() {
    const EXCHANGES: usize = 2000;
    let token = frame::master_frame(address::MODBUS40, Token::ModbusRead.into(), &[]).unwrap();
    let response = frame::response_frame(Token::ModbusRead.into(), &[0x07]).unwrap();
    let exchange = [token.as_slice(), ACKNOWLEDGE].concat();
    let input = vec![exchange.as_slice(); EXCHANGES];

    let wire = test(&input, |gateway| {
        gateway.set_acknowledge(address::MODBUS40, true).unwrap();
        gateway.handler().set_constant(address::MODBUS40, Token::ModbusRead.into(), response.to_vec()).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| gateway.service().unwrap());
            scope.spawn(|| {
                // every accessor while holding the handler
                for _ in 0 .. 10_000 {
                    let multiplexer = gateway.handler();
                    assert_eq!(multiplexer.pending(address::MODBUS40, Token::ModbusRead.into()), 0);
                    gateway.statistics();
                    gateway.state();
                    gateway.message_still_in_progress();
                    gateway.set_acknowledge(address::MODBUS40, true).unwrap();
                    assert!(gateway.acknowledges(address::MODBUS40));
                    drop(multiplexer);
                }
            });
        });
        let statistics = gateway.statistics();
        assert_eq!(statistics.responses, EXCHANGES as u32);
        assert_eq!(statistics.exchanges, EXCHANGES as u32);
        assert_eq!(statistics.faults(), 0);
    });
    assert_eq!(wire.sent, response.repeat(EXCHANGES));
}

#[test]
fn disconnect_stops_processing() {
    let token = frame::master_frame(address::MODBUS40, Token::ModbusRead.into(), &[]).unwrap();

    let wire = test(&[token.as_slice()], |gateway| {
        gateway.set_acknowledge(address::MODBUS40, true).unwrap();
        gateway.disconnect();
        assert!(!gateway.connected());
        gateway.service().unwrap();
        assert_eq!(gateway.statistics().exchanges, 0);

        gateway.connect();
        gateway.service().unwrap();
        assert_eq!(gateway.statistics().exchanges, 1);
    });
    assert_eq!(wire.sent, [ACK]);
}

//! Host-side CLI harness driving a [`dlp_protocol::DlpEngine`] over a real
//! serial port. A background thread drains the OS serial fd into a shared
//! byte queue, and the main thread owns the engine and calls `update()` in
//! a tight loop. There's no timing-based frame-boundary detection here:
//! frames are self-delimited by SOT/EOT bytes, so raw bytes are handed to
//! the engine as they arrive and its own decoder finds the boundaries.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use dlp_common::bus::{BusPollError, BusRead, BusTransferError, BusWrite};
use dlp_common::time::Clock;
use dlp_protocol::{DefaultDlpTimings, DlpConfig, DlpEngine};
use nix::time::{clock_gettime, ClockId};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};

#[derive(clap::ValueEnum, Clone, Debug)]
enum RoleArg {
    Master,
    Slave,
}

#[derive(clap::Subcommand, Debug)]
enum Mode {
    /// Stay connected (or listening) and print whatever arrives.
    Listen,
    /// Send a short text message on a timer once connected.
    SendText {
        message: String,
        #[clap(long, default_value_t = 500)]
        period_ms: u64,
    },
    /// Stream a file's bytes through one blocking `put_buffer` call.
    SendFile { path: String },
    /// Write whatever arrives to a file.
    RecvFile { path: String },
}

#[derive(Parser, Debug)]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0.
    port: String,
    baud_rate: u32,

    #[clap(long, value_enum)]
    role: RoleArg,

    #[clap(long, default_value_t = 3000)]
    connect_timeout_ms: u32,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Clone)]
struct SerialBus {
    rx: Arc<Mutex<VecDeque<u8>>>,
    port: Arc<SerialPort>,
}

impl BusRead for SerialBus {
    fn poll_next(&self, buf: &mut [u8]) -> Result<u16, BusPollError> {
        let mut q = self.rx.lock().unwrap();
        if q.is_empty() {
            return Err(BusPollError::WouldBlock);
        }
        let n = buf.len().min(q.len());
        for slot in buf.iter_mut().take(n) {
            *slot = q.pop_front().unwrap();
        }
        Ok(n as u16)
    }
}

impl BusWrite for SerialBus {
    fn transfer(&mut self, buf: &[u8]) -> Result<(), BusTransferError> {
        self.port.write(buf).map(|_| ()).map_err(|_| BusTransferError::WouldBlock)
    }

    fn is_tx_busy(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct LinuxMonotonicClock;

impl Clock for LinuxMonotonicClock {
    fn current_nanos(&self) -> u64 {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap();
        (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64
    }
}

fn open_port(path: &str, baud_rate: u32) -> SerialPort {
    let port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud_rate).unwrap();
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);
        settings.set_flow_control(FlowControl::None);
        Ok(settings)
    })
    .expect("failed to open serial port");
    port.set_read_timeout(Duration::from_millis(50)).unwrap();
    port
}

fn spawn_reader(port: Arc<SerialPort>, rx: Arc<Mutex<VecDeque<u8>>>) {
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match port.as_ref().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => rx.lock().unwrap().extend(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("serial read error: {e}");
                    break;
                }
            }
        }
    });
}

fn main() {
    env_logger::builder().filter_level(log::LevelFilter::Info).parse_default_env().init();
    let args = Args::parse();

    let port = Arc::new(open_port(&args.port, args.baud_rate));
    let rx_queue = Arc::new(Mutex::new(VecDeque::new()));
    spawn_reader(Arc::clone(&port), Arc::clone(&rx_queue));

    let bus = SerialBus { rx: rx_queue, port };
    let clock = LinuxMonotonicClock;
    let mut engine: DlpEngine<SerialBus, LinuxMonotonicClock, DefaultDlpTimings> =
        DlpEngine::new(bus, clock, DlpConfig::default());

    match args.role {
        RoleArg::Master => {
            engine.master_listen(true);
            log::info!("listening as master");
        }
        RoleArg::Slave => {
            engine.slave_connect(args.connect_timeout_ms);
            log::info!("connecting as slave, timeout {} ms", args.connect_timeout_ms);
        }
    }

    let mut recv_file = match &args.mode {
        Mode::RecvFile { path } => Some(File::create(path).expect("failed to create output file")),
        _ => None,
    };
    let mut send_file_contents = match &args.mode {
        Mode::SendFile { path } => Some(std::fs::read(path).expect("failed to read input file")),
        _ => None,
    };

    let mut was_connected = false;
    let mut last_text_send = Instant::now();
    let mut send_file_done = false;

    loop {
        engine.update();

        let is_connected = match args.role {
            RoleArg::Master => engine.master_is_client_connected(),
            RoleArg::Slave => engine.slave_is_connected(),
        };
        if is_connected != was_connected {
            log::info!("link {}", if is_connected { "connected" } else { "disconnected" });
            was_connected = is_connected;
        }

        if engine.is_data_available() {
            let mut buf = [0u8; 1024];
            let n = engine.read_data(&mut buf);
            match &mut recv_file {
                Some(f) => f.write_all(&buf[..n]).unwrap(),
                None => log::info!("received {} bytes: {:?}", n, String::from_utf8_lossy(&buf[..n])),
            }
        }

        if is_connected {
            match &args.mode {
                Mode::Listen | Mode::RecvFile { .. } => {}
                Mode::SendText { message, period_ms } => {
                    if last_text_send.elapsed() >= Duration::from_millis(*period_ms) {
                        if engine.put_buffer(message.as_bytes(), 2000) {
                            log::info!("sent {:?}", message);
                        } else {
                            log::warn!("put_buffer failed");
                        }
                        last_text_send = Instant::now();
                    }
                }
                Mode::SendFile { .. } => {
                    if let Some(contents) = send_file_contents.take() {
                        log::info!(
                            "sending {} bytes across {} fragments",
                            contents.len(),
                            engine.subpacket_count(&contents)
                        );
                        if engine.put_buffer(&contents, 30_000) {
                            log::info!("file transfer completed");
                        } else {
                            log::error!("file transfer failed");
                        }
                        send_file_done = true;
                    }
                }
            }
        }

        if matches!(args.mode, Mode::SendFile { .. }) && send_file_done {
            break;
        }

        thread::sleep(Duration::from_millis(1));
    }
}

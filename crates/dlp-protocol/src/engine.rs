//! The protocol engine: connection state machine, send/receive windows,
//! control-frame queue and the `update()` driver loop. The heart of this
//! crate.
//!
//! The driver is a three-phase `update()` == `do_rx()` +
//! `do_timed_actions()` + `do_tx()` loop: drain whatever the bus has
//! waiting, advance any expired timer, then send at most one frame, in a
//! fixed priority order, per tick.

use core::marker::PhantomData;
use core::time::Duration;

use dlp_common::bus::{BusPollError, BusRead, BusWrite};
use dlp_common::time::{Clock, Timer};
use dlp_common::util::RingBuffer;
use dlp_common::{dev_info, dev_trace, dev_warn};
use ringbuffer::{ConstGenericRingBuffer, RingBuffer as ExtRingBuffer};

use crate::config::DlpConfig;
use crate::constants::{
    CONTROL_QUEUE_CAPACITY, DELIVERED_QUEUE_CAPACITY, DISCONNECT_REPEAT_COUNT, ERROR_THRESHOLD,
    I_FRAME_DATA_MAX, MAX_ENCODED_FRAME_LEN,
};
use crate::decoder::{Decoder, DecoderEvent};
use crate::error::DlpError;
use crate::fragmenter;
use crate::timings::{DefaultDlpTimings, DlpTimings};
use crate::wire::{self, Address, Control, SKind, UKind};

/// Which side of the link this engine instance is playing. Fixed for the
/// lifetime of a connection; cleared back to `None` whenever the state
/// machine returns to IDLE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Clone, Copy, Debug)]
enum ConnState {
    Idle,
    Listening,
    Connecting { overall_deadline: Timer, next_beacon: Timer },
    Connected,
}

#[derive(Clone, Debug)]
struct PendingFrame {
    tx_seq: u8,
    data: heapless::Vec<u8, I_FRAME_DATA_MAX>,
    sent: bool,
    retry_deadline: Timer,
}

/// The size of one `poll_next` read. Large enough that a full-speed UART
/// doesn't need more than one call per `update()` tick under normal load;
/// `do_rx` loops anyway, so this is a throughput knob, not a correctness
/// one.
const RX_POLL_CHUNK: usize = 64;

/// Drives one end of a data-link connection: the connection state machine,
/// the single-outstanding-I-frame send window, the receive window and its
/// delivered-byte queue, and the outbound control-frame queue.
///
/// `B` is the external byte transport, `C` the monotonic clock, and `T`
/// the compile-time timing configuration (see [`DlpTimings`]).
pub struct DlpEngine<B, C, T = DefaultDlpTimings> {
    bus: B,
    clock: C,
    config: DlpConfig,

    decoder: Decoder,
    state: ConnState,
    role: Option<Role>,

    tx_seq: u8,
    rx_seq: u8,
    tx_errors: u8,
    rx_errors: u8,
    seq_reset_requested: bool,

    pending: Option<PendingFrame>,
    control_queue: ConstGenericRingBuffer<Control, CONTROL_QUEUE_CAPACITY>,
    rx_queue: RingBuffer<u8, DELIVERED_QUEUE_CAPACITY>,

    put_buffer_busy: bool,

    _timings: PhantomData<T>,
}

impl<B, C, T> DlpEngine<B, C, T>
where
    B: BusRead + BusWrite,
    C: Clock,
    T: DlpTimings,
{
    pub fn new(bus: B, clock: C, config: DlpConfig) -> Self {
        DlpEngine {
            bus,
            clock,
            config,
            decoder: Decoder::new(),
            state: ConnState::Idle,
            role: None,
            tx_seq: 0,
            rx_seq: 0,
            tx_errors: 0,
            rx_errors: 0,
            seq_reset_requested: false,
            pending: None,
            control_queue: ConstGenericRingBuffer::new(),
            rx_queue: RingBuffer::new(),
            put_buffer_busy: false,
            _timings: PhantomData,
        }
    }

    pub fn config(&self) -> DlpConfig {
        self.config
    }

    pub fn set_use_port(&mut self, on: bool) {
        self.config.use_port = on;
    }

    pub fn enable_debug(&mut self, on: bool) {
        self.config.debug_enabled = on;
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    // --- Master (listener) API -------------------------------------------------

    /// `master_listen(true)` is only valid from IDLE; `master_listen(false)`
    /// only from LISTENING. Any other call is ignored (per the role-
    /// conditioned transition table, unmentioned events are ignored).
    pub fn master_listen(&mut self, on: bool) -> bool {
        if on {
            if !matches!(self.state, ConnState::Idle) {
                return false;
            }
            self.role = Some(Role::Master);
            self.reset_session();
            self.control_queue = ConstGenericRingBuffer::new();
            self.state = ConnState::Listening;
            dev_info!("master: listening");
            true
        } else {
            if !matches!(self.state, ConnState::Listening) {
                return false;
            }
            self.state = ConnState::Idle;
            self.role = None;
            true
        }
    }

    pub fn master_is_listening(&self) -> bool {
        matches!(self.state, ConnState::Listening)
    }

    pub fn master_is_client_connected(&self) -> bool {
        self.role == Some(Role::Master) && matches!(self.state, ConnState::Connected)
    }

    // --- Slave (initiator) API --------------------------------------------------

    pub fn slave_connect(&mut self, timeout_ms: u32) -> bool {
        if !matches!(self.state, ConnState::Idle) {
            return false;
        }
        self.role = Some(Role::Slave);
        self.reset_session();
        self.control_queue = ConstGenericRingBuffer::new();
        self.queue_control(Control::U { kind: UKind::Connect });
        self.state = ConnState::Connecting {
            overall_deadline: self.clock.deadline_after(Duration::from_millis(timeout_ms as u64)),
            next_beacon: self.clock.deadline_after(T::SLAVE_BEACON_PERIOD),
        };
        dev_info!("slave: connecting");
        true
    }

    pub fn slave_is_connecting(&self) -> bool {
        matches!(self.state, ConnState::Connecting { .. })
    }

    pub fn slave_is_connected(&self) -> bool {
        self.role == Some(Role::Slave) && matches!(self.state, ConnState::Connected)
    }

    /// Blocks the caller (by looping `update()` on this engine) for up to
    /// [`DlpTimings::DISCONNECT_GRACE`] waiting for the peer's
    /// DISCONNECT_ACK, then tears the connection down unconditionally.
    /// Matches the source's synchronous semantics, modeled here as an
    /// explicit poll loop rather than an inline spin-wait on a shared flag.
    pub fn slave_disconnect(&mut self) -> bool {
        if self.role != Some(Role::Slave) || !matches!(self.state, ConnState::Connected) {
            return false;
        }

        for _ in 0..DISCONNECT_REPEAT_COUNT {
            self.queue_control(Control::U { kind: UKind::Disconnect });
        }

        let grace_deadline = self.clock.deadline_after(T::DISCONNECT_GRACE);
        while matches!(self.state, ConnState::Connected) && !self.clock.is_expired(&grace_deadline) {
            self.update();
        }

        if matches!(self.state, ConnState::Connected) {
            dev_warn!("slave: disconnect grace period elapsed, forcing teardown");
            self.teardown_connection();
        }
        true
    }

    // --- Data path ---------------------------------------------------------------

    pub fn subpacket_count(&self, bytes: &[u8]) -> u16 {
        fragmenter::subpacket_count(bytes)
    }

    pub fn is_put_buffer_busy(&self) -> bool {
        self.put_buffer_busy
    }

    /// The only call in this API that blocks: loops `update()` on this
    /// engine, fragment by fragment, until every fragment of `bytes` has
    /// been acknowledged, the link drops, or `overall_timeout_ms` elapses.
    pub fn put_buffer(&mut self, bytes: &[u8], overall_timeout_ms: u32) -> bool {
        if !matches!(self.state, ConnState::Connected) {
            return false;
        }
        if self.put_buffer_busy {
            return false;
        }

        self.put_buffer_busy = true;
        let overall_deadline = self.clock.deadline_after(Duration::from_millis(overall_timeout_ms as u64));

        let mut pos = 0usize;
        let ok = loop {
            if pos >= bytes.len() {
                break true;
            }
            let end = fragmenter::next_fragment_end(bytes, pos);
            if !self.send_fragment_blocking(&bytes[pos..end], &overall_deadline) {
                break false;
            }
            pos = end;
        };

        self.put_buffer_busy = false;
        ok
    }

    fn send_fragment_blocking(&mut self, fragment: &[u8], overall_deadline: &Timer) -> bool {
        let mut data = heapless::Vec::new();
        if data.extend_from_slice(fragment).is_err() {
            dev_warn!("fragment exceeds I-frame data capacity, dropping put_buffer");
            return false;
        }

        self.pending = Some(PendingFrame {
            tx_seq: self.tx_seq,
            data,
            sent: false,
            retry_deadline: Timer::default(),
        });

        let fragment_deadline = self.clock.deadline_after(T::FRAGMENT_SAFETY_TIMEOUT);

        loop {
            self.update();

            if !matches!(self.state, ConnState::Connected) {
                return false;
            }
            if self.pending.is_none() {
                return true;
            }
            if self.clock.is_expired(&fragment_deadline) {
                dev_warn!("fragment safety timeout elapsed, dropping connection");
                self.teardown_connection();
                return false;
            }
            if self.clock.is_expired(overall_deadline) {
                dev_warn!("put_buffer overall timeout elapsed, dropping connection");
                self.teardown_connection();
                return false;
            }
        }
    }

    pub fn is_data_available(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    pub fn read_data(&mut self, out: &mut [u8]) -> usize {
        let n = self.rx_queue.read(out);
        self.rx_queue.drop_first(n);
        n
    }

    // --- Driver loop ---------------------------------------------------------------

    /// `do_rx` + `do_timed_actions` + `do_tx`, exactly as the sibling
    /// link-layer crate's `SplitBus::poll()` does it.
    pub fn update(&mut self) {
        if !self.config.use_port {
            return;
        }
        self.do_rx();
        self.do_timed_actions();
        self.do_tx();
    }

    fn do_rx(&mut self) {
        let mut buf = [0u8; RX_POLL_CHUNK];
        loop {
            match self.bus.poll_next(&mut buf) {
                Ok(n) => {
                    for &b in &buf[..n as usize] {
                        self.feed_byte(b);
                    }
                }
                Err(BusPollError::WouldBlock) => break,
                Err(BusPollError::BufferOverflow) => {
                    dev_warn!("bus read buffer overflow");
                    break;
                }
            }
        }
    }

    fn feed_byte(&mut self, byte: u8) {
        match self.decoder.push_byte(byte) {
            DecoderEvent::Nothing => {}
            DecoderEvent::Overflow => {
                self.note_rx_error(DlpError::BufferOverflow);
            }
            DecoderEvent::Boundary => {
                if let Some((raw, running_crc)) = self.decoder.frame() {
                    self.dispatch_raw_frame(raw, running_crc);
                }
                self.decoder.reset();
            }
        }
    }

    fn dispatch_raw_frame(&mut self, raw: &[u8], running_crc: u16) {
        match wire::parse_frame(raw) {
            Ok((addr, ctrl, data)) => {
                let reported = wire::reported_crc(raw);
                if reported != running_crc {
                    self.note_rx_error(DlpError::CrcMismatch);
                } else {
                    self.handle_frame(addr, ctrl, data);
                }
            }
            Err(e) => self.note_rx_error(e),
        }
    }

    fn note_rx_error(&mut self, err: DlpError) {
        dev_warn!("frame error: {}", err);
        if !matches!(self.state, ConnState::Connected) {
            return;
        }
        if self.config.emit_generic_error_on_crc_mismatch && err == DlpError::CrcMismatch {
            self.queue_control(Control::U { kind: UKind::GenericError });
        }
        self.rx_errors = self.rx_errors.saturating_add(1);
        if self.rx_errors >= ERROR_THRESHOLD {
            dev_warn!("rx error threshold reached, dropping connection");
            self.teardown_connection();
        }
    }

    fn handle_frame(&mut self, addr: Address, ctrl: Control, data: &[u8]) {
        match ctrl {
            Control::U { kind } => self.handle_u_frame(addr, kind),
            Control::S { kind, rx_seq } => self.handle_s_frame(addr, kind, rx_seq),
            Control::I { tx_seq, .. } => self.handle_i_frame(addr, tx_seq, data),
        }
    }

    fn handle_u_frame(&mut self, addr: Address, kind: UKind) {
        match (self.state, kind) {
            (ConnState::Listening, UKind::Connect) => {
                if addr == Address::SLAVE {
                    self.role = Some(Role::Master);
                    self.reset_session();
                    self.state = ConnState::Connected;
                    self.queue_control(Control::U { kind: UKind::ConnectAck });
                    dev_info!("master: accepted connection from slave");
                } else {
                    self.queue_control(Control::U { kind: UKind::ConnectNack });
                }
            }
            (ConnState::Connecting { .. }, UKind::ConnectAck) => {
                if addr == Address::MASTER {
                    self.reset_session();
                    self.state = ConnState::Connected;
                    dev_info!("slave: connected to master");
                }
            }
            (ConnState::Connected, UKind::Connect) if self.role == Some(Role::Master) => {
                // Deterministic re-ACK without a full reset: a CONNECT
                // received while already CONNECTED is answered the same
                // way, but does not disturb the running session.
                if addr == Address::SLAVE {
                    self.queue_control(Control::U { kind: UKind::ConnectAck });
                } else {
                    self.queue_control(Control::U { kind: UKind::ConnectNack });
                }
            }
            (ConnState::Connected, UKind::Disconnect) => {
                for _ in 0..DISCONNECT_REPEAT_COUNT {
                    self.queue_control(Control::U { kind: UKind::DisconnectAck });
                }
                self.teardown_connection();
            }
            (ConnState::Connected, UKind::DisconnectAck) => {
                // No reply, and no extra reset beyond what teardown already
                // does: the peer already tore its own side down.
                self.teardown_connection();
            }
            (ConnState::Connected, UKind::SeqReset) => {
                self.tx_seq = 0;
                self.rx_seq = 0;
                self.seq_reset_requested = true;
                dev_info!("peer requested a sequence reset");
            }
            (ConnState::Connected, UKind::GenericError) => {
                dev_info!("peer reported a generic error");
            }
            _ => {
                if self.config.debug_enabled {
                    dev_trace!("ignoring U-frame {:?} from {:?} in current state", kind, addr);
                }
            }
        }
    }

    fn handle_s_frame(&mut self, addr: Address, kind: SKind, rx_seq: u8) {
        if !matches!(self.state, ConnState::Connected) || addr != self.peer_address() {
            return;
        }
        if rx_seq != self.tx_seq {
            self.tx_errors = self.tx_errors.saturating_add(1);
            self.maybe_drop_on_tx_error();
            return;
        }
        match kind {
            SKind::Ack => {
                self.tx_seq = (self.tx_seq + 1) % 8;
                self.tx_errors = 0;
                self.pending = None;
            }
            SKind::Nack => {
                if let Some(p) = &mut self.pending {
                    p.sent = false;
                }
                self.tx_errors = self.tx_errors.saturating_add(1);
                self.maybe_drop_on_tx_error();
            }
        }
    }

    fn handle_i_frame(&mut self, addr: Address, tx_seq: u8, data: &[u8]) {
        if !matches!(self.state, ConnState::Connected) || addr != self.peer_address() {
            return;
        }

        let prev_seq = (self.rx_seq + 7) % 8;

        if tx_seq == self.rx_seq {
            if self.rx_queue.free() >= data.len() {
                self.rx_queue.write(data);
                self.queue_control(Control::S { kind: SKind::Ack, rx_seq: self.rx_seq });
                self.rx_seq = (self.rx_seq + 1) % 8;
                self.rx_errors = 0;
            } else {
                // Backpressure: the application hasn't drained enough of
                // the delivered-byte queue to fit this fragment. NACK it
                // so the peer retries, rather than overwriting undelivered
                // data.
                self.queue_control(Control::S { kind: SKind::Nack, rx_seq: self.rx_seq });
            }
        } else if tx_seq == prev_seq {
            // Duplicate of the frame we already acked (our ACK was lost in
            // transit): re-ack without re-delivering.
            self.queue_control(Control::S { kind: SKind::Ack, rx_seq: prev_seq });
        } else {
            dev_warn!("sequence desync: expected tx_seq {} or {}, got {}", self.rx_seq, prev_seq, tx_seq);
            self.tx_seq = 0;
            self.rx_seq = 0;
            self.queue_control(Control::U { kind: UKind::SeqReset });
            self.rx_errors = self.rx_errors.saturating_add(1);
            self.maybe_drop_on_rx_error();
        }
    }

    fn maybe_drop_on_tx_error(&mut self) {
        if self.tx_errors >= ERROR_THRESHOLD {
            dev_warn!("tx error threshold reached, dropping connection");
            self.teardown_connection();
        }
    }

    fn maybe_drop_on_rx_error(&mut self) {
        if self.rx_errors >= ERROR_THRESHOLD {
            dev_warn!("rx error threshold reached, dropping connection");
            self.teardown_connection();
        }
    }

    fn do_timed_actions(&mut self) {
        if let ConnState::Connecting { overall_deadline, next_beacon } = self.state {
            if self.clock.is_expired(&overall_deadline) {
                for _ in 0..DISCONNECT_REPEAT_COUNT {
                    self.queue_control(Control::U { kind: UKind::Disconnect });
                }
                dev_warn!("slave: connect attempt timed out");
                self.state = ConnState::Idle;
                // Deliberately leave `role` as `Slave`: the three DISCONNECT
                // frames just queued above still need to drain through
                // `do_tx`, which stamps their source address from
                // `own_address()`. Clearing it here would mislabel them as
                // coming from MASTER. The next `slave_connect`/
                // `master_listen(true)` call overwrites it regardless.
            } else if self.clock.is_expired(&next_beacon) {
                self.queue_control(Control::U { kind: UKind::Connect });
                self.state = ConnState::Connecting {
                    overall_deadline,
                    next_beacon: self.clock.deadline_after(T::SLAVE_BEACON_PERIOD),
                };
            }
        }
    }

    fn do_tx(&mut self) {
        if self.bus.is_tx_busy() {
            return;
        }

        // Priority 1 (slave beacon) is handled in `do_timed_actions`, which
        // only ever enqueues into the control queue; priority 2 is this
        // queue, drained before anything else.
        if let Some(&ctrl) = self.control_queue.peek() {
            let addr = self.own_address();
            if self.transmit(addr, ctrl, &[]).is_ok() {
                self.control_queue.dequeue();
            }
            return;
        }

        if !matches!(self.state, ConnState::Connected) {
            return;
        }

        let is_first_send = match &self.pending {
            None => return,
            Some(p) => !p.sent,
        };

        if is_first_send {
            self.send_pending(false);
            return;
        }

        let expired = self
            .pending
            .as_ref()
            .map(|p| self.clock.is_expired(&p.retry_deadline))
            .unwrap_or(false);

        if expired {
            self.tx_errors = self.tx_errors.saturating_add(1);
            if self.tx_errors >= ERROR_THRESHOLD {
                dev_warn!("tx error threshold reached, dropping connection");
                self.teardown_connection();
                return;
            }
            if self.seq_reset_requested {
                self.seq_reset_requested = false;
                if let Some(p) = &mut self.pending {
                    p.tx_seq = 0;
                }
            }
            self.send_pending(true);
        }
    }

    fn send_pending(&mut self, is_retry: bool) {
        let rx_seq = self.rx_seq;
        let addr = self.own_address();
        let Some(pending) = &self.pending else { return };
        let tx_seq = pending.tx_seq;
        let data: heapless::Vec<u8, I_FRAME_DATA_MAX> = pending.data.clone();

        if self.transmit(addr, Control::I { tx_seq, rx_seq }, &data).is_ok() {
            if let Some(p) = &mut self.pending {
                p.sent = true;
                p.retry_deadline = self.clock.deadline_after(T::RETRY_TIMEOUT);
            }
            if is_retry && self.config.debug_enabled {
                dev_trace!("retransmitted I-frame tx_seq={}", tx_seq);
            }
        }
    }

    fn transmit(&mut self, addr: Address, ctrl: Control, data: &[u8]) -> Result<(), DlpError> {
        let mut buf = [0u8; MAX_ENCODED_FRAME_LEN];
        let n = wire::encode_frame(addr, ctrl, data, &mut buf)?;
        self.bus.transfer(&buf[..n]).map_err(|_| DlpError::TransferFailed)
    }

    fn queue_control(&mut self, control: Control) {
        if self.control_queue.is_full() {
            dev_warn!("control frame queue full, dropping oldest");
        }
        self.control_queue.push(control);
    }

    fn own_address(&self) -> Address {
        match self.role {
            Some(Role::Slave) => Address::SLAVE,
            _ => Address::MASTER,
        }
    }

    fn peer_address(&self) -> Address {
        match self.role {
            Some(Role::Master) => Address::SLAVE,
            _ => Address::MASTER,
        }
    }

    /// Resets the decoder, send window and receive window: every
    /// transition into or out of CONNECTED gets a clean slate. Deliberately
    /// leaves the control queue alone: the caller may have just queued
    /// frames (DISCONNECT_ACK replies, a fresh CONNECT_ACK) that still need
    /// to drain after this call.
    fn reset_session(&mut self) {
        self.decoder.reset();
        self.tx_seq = 0;
        self.rx_seq = 0;
        self.tx_errors = 0;
        self.rx_errors = 0;
        self.pending = None;
        self.seq_reset_requested = false;
        self.rx_queue = RingBuffer::new();
        self.put_buffer_busy = false;
    }

    fn teardown_connection(&mut self) {
        let next_state = match self.role {
            Some(Role::Master) => ConnState::Listening,
            _ => ConnState::Idle,
        };
        self.reset_session();
        self.state = next_state;
        if matches!(next_state, ConnState::Idle) {
            self.role = None;
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone)]
    struct SharedClock(Rc<Cell<u64>>);

    impl SharedClock {
        fn new() -> Self {
            SharedClock(Rc::new(Cell::new(0)))
        }
    }

    impl Clock for SharedClock {
        fn current_nanos(&self) -> u64 {
            self.0.get()
        }
    }

    /// A clock that advances its own time by a fixed step every time it's
    /// read. Lets a blocking call (`put_buffer`, `slave_disconnect`) that
    /// internally loops on `Clock::is_expired` make deterministic progress
    /// without a real sleep.
    #[derive(Clone)]
    struct AutoAdvanceClock {
        nanos: Rc<Cell<u64>>,
        step_nanos: u64,
    }

    impl AutoAdvanceClock {
        fn new(step: Duration) -> Self {
            AutoAdvanceClock { nanos: Rc::new(Cell::new(0)), step_nanos: step.as_nanos() as u64 }
        }
    }

    impl Clock for AutoAdvanceClock {
        fn current_nanos(&self) -> u64 {
            let n = self.nanos.get();
            self.nanos.set(n + self.step_nanos);
            n
        }
    }

    type Channel = Rc<RefCell<VecDeque<u8>>>;

    struct LoopbackBus {
        tx: Channel,
        rx: Channel,
        drop_next_write: Rc<Cell<bool>>,
    }

    impl BusWrite for LoopbackBus {
        fn transfer(&mut self, buf: &[u8]) -> Result<(), dlp_common::bus::BusTransferError> {
            if self.drop_next_write.get() {
                self.drop_next_write.set(false);
                return Ok(());
            }
            self.tx.borrow_mut().extend(buf.iter().copied());
            Ok(())
        }

        fn is_tx_busy(&self) -> bool {
            false
        }
    }

    impl BusRead for LoopbackBus {
        fn poll_next(&self, buf: &mut [u8]) -> Result<u16, BusPollError> {
            let mut q = self.rx.borrow_mut();
            if q.is_empty() {
                return Err(BusPollError::WouldBlock);
            }
            let n = core::cmp::min(buf.len(), q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            Ok(n as u16)
        }
    }

    struct NullBus;

    impl BusWrite for NullBus {
        fn transfer(&mut self, _buf: &[u8]) -> Result<(), dlp_common::bus::BusTransferError> {
            Ok(())
        }
        fn is_tx_busy(&self) -> bool {
            false
        }
    }

    impl BusRead for NullBus {
        fn poll_next(&self, _buf: &mut [u8]) -> Result<u16, BusPollError> {
            Err(BusPollError::WouldBlock)
        }
    }

    fn loopback_pair() -> (LoopbackBus, LoopbackBus) {
        let m2s = Rc::new(RefCell::new(VecDeque::new()));
        let s2m = Rc::new(RefCell::new(VecDeque::new()));
        let master_bus = LoopbackBus { tx: m2s.clone(), rx: s2m.clone(), drop_next_write: Rc::new(Cell::new(false)) };
        let slave_bus = LoopbackBus { tx: s2m, rx: m2s, drop_next_write: Rc::new(Cell::new(false)) };
        (master_bus, slave_bus)
    }

    fn pump_until<FM, FS, FD>(master: &mut FM, slave: &mut FS, mut done: FD, max_ticks: u32)
    where
        FM: FnMut(),
        FS: FnMut(),
        FD: FnMut() -> bool,
    {
        for _ in 0..max_ticks {
            master();
            slave();
            if done() {
                return;
            }
        }
        panic!("pump_until exceeded max_ticks without reaching the expected state");
    }

    #[test]
    fn slave_connects_to_listening_master() {
        let (master_bus, slave_bus) = loopback_pair();
        let clock = SharedClock::new();
        let mut master: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(master_bus, clock.clone(), DlpConfig::default());
        let mut slave: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(slave_bus, clock.clone(), DlpConfig::default());

        assert!(master.master_listen(true));
        assert!(slave.slave_connect(2000));

        pump_until(
            &mut || master.update(),
            &mut || slave.update(),
            || master.master_is_client_connected() && slave.slave_is_connected(),
            1000,
        );
    }

    #[test]
    fn data_sent_by_slave_is_delivered_to_master() {
        let (master_bus, slave_bus) = loopback_pair();
        let clock = SharedClock::new();
        let mut master: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(master_bus, clock.clone(), DlpConfig::default());
        let mut slave: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(slave_bus, clock.clone(), DlpConfig::default());

        master.master_listen(true);
        slave.slave_connect(2000);
        pump_until(
            &mut || master.update(),
            &mut || slave.update(),
            || master.master_is_client_connected() && slave.slave_is_connected(),
            1000,
        );

        slave.pending = Some(PendingFrame {
            tx_seq: slave.tx_seq,
            data: heapless::Vec::from_slice(b"HELLO").unwrap(),
            sent: false,
            retry_deadline: Timer::default(),
        });

        pump_until(&mut || master.update(), &mut || slave.update(), || slave.pending.is_none(), 1000);

        assert!(master.is_data_available());
        let mut out = [0u8; 16];
        let n = master.read_data(&mut out);
        assert_eq!(&out[..n], b"HELLO");
    }

    #[test]
    fn lost_ack_causes_a_harmless_duplicate_retransmission() {
        let (master_bus, slave_bus) = loopback_pair();
        let clock = AutoAdvanceClock::new(Duration::from_millis(1));
        let mut master: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(master_bus, clock.clone(), DlpConfig::default());
        let mut slave: DlpEngine<_, _, DefaultDlpTimings> = DlpEngine::new(slave_bus, clock.clone(), DlpConfig::default());

        master.master_listen(true);
        slave.slave_connect(2000);
        pump_until(
            &mut || master.update(),
            &mut || slave.update(),
            || master.master_is_client_connected() && slave.slave_is_connected(),
            1000,
        );

        // Drop the next frame the slave's bus would deliver to master: this
        // is the ACK for the upcoming fragment, simulated as an in-flight
        // loss on the master->slave leg instead (the ACK travels that way).
        master.bus.drop_next_write.set(true);

        slave.pending = Some(PendingFrame {
            tx_seq: slave.tx_seq,
            data: heapless::Vec::from_slice(b"HI").unwrap(),
            sent: false,
            retry_deadline: Timer::default(),
        });

        pump_until(&mut || master.update(), &mut || slave.update(), || slave.pending.is_none(), 5000);

        // Master delivered the data exactly once even though its first ACK
        // was lost and the slave had to retransmit.
        let mut out = [0u8; 16];
        let n = master.read_data(&mut out);
        assert_eq!(&out[..n], b"HI");
        assert!(!master.is_data_available());
    }

    #[test]
    fn backpressure_nacks_until_the_application_drains_the_queue() {
        let clock = SharedClock::new();
        let mut master: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        master.role = Some(Role::Master);
        master.state = ConnState::Connected;

        // Fill the delivered-byte queue to within one byte of capacity.
        let filler = [0u8; DELIVERED_QUEUE_CAPACITY - 1];
        master.rx_queue.write(&filler);

        master.handle_i_frame(Address::SLAVE, 0, b"AB");
        assert!(matches!(master.control_queue.peek(), Some(Control::S { kind: SKind::Nack, .. })));
        assert_eq!(master.rx_seq, 0, "rx_seq must not advance on a NACK'd fragment");

        master.rx_queue.drop_first(master.rx_queue.len());
        master.control_queue.dequeue();

        master.handle_i_frame(Address::SLAVE, 0, b"AB");
        assert!(matches!(master.control_queue.peek(), Some(Control::S { kind: SKind::Ack, .. })));
        assert_eq!(master.rx_seq, 1);
    }

    #[test]
    fn duplicate_i_frame_is_re_acked_without_re_delivery() {
        let clock = SharedClock::new();
        let mut master: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        master.role = Some(Role::Master);
        master.state = ConnState::Connected;

        master.handle_i_frame(Address::SLAVE, 0, b"X");
        master.control_queue.dequeue();
        assert_eq!(master.rx_seq, 1);

        // Peer didn't see our ACK and retransmits the same tx_seq.
        master.handle_i_frame(Address::SLAVE, 0, b"X");
        assert!(matches!(master.control_queue.peek(), Some(Control::S { kind: SKind::Ack, rx_seq: 0 })));
        assert_eq!(master.rx_seq, 1, "rx_seq must not advance twice for one fragment");

        let mut out = [0u8; 8];
        let n = master.read_data(&mut out);
        assert_eq!(&out[..n], b"X", "the duplicate must not be delivered a second time");
    }

    #[test]
    fn unexpected_tx_seq_triggers_a_local_sequence_reset() {
        let clock = SharedClock::new();
        let mut master: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        master.role = Some(Role::Master);
        master.state = ConnState::Connected;
        master.rx_seq = 3;

        master.handle_i_frame(Address::SLAVE, 6, b"X");

        assert_eq!(master.rx_seq, 0);
        assert_eq!(master.tx_seq, 0);
        assert_eq!(master.rx_errors, 1);
        assert!(matches!(master.control_queue.peek(), Some(Control::U { kind: UKind::SeqReset })));
    }

    #[test]
    fn tx_seq_wraps_from_seven_to_zero_on_ack() {
        let clock = SharedClock::new();
        let mut slave: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        slave.role = Some(Role::Slave);
        slave.state = ConnState::Connected;
        slave.tx_seq = 7;
        slave.pending = Some(PendingFrame {
            tx_seq: 7,
            data: heapless::Vec::from_slice(b"Z").unwrap(),
            sent: true,
            retry_deadline: Timer::default(),
        });

        slave.handle_s_frame(Address::MASTER, SKind::Ack, 7);

        assert_eq!(slave.tx_seq, 0);
        assert!(slave.pending.is_none());
    }

    #[test]
    fn error_threshold_forces_disconnect_when_the_peer_never_answers() {
        let clock = AutoAdvanceClock::new(Duration::from_millis(1));
        let mut slave: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        slave.role = Some(Role::Slave);
        slave.state = ConnState::Connected;

        let ok = slave.put_buffer(b"nobody is listening", 20_000);

        assert!(!ok);
        assert!(matches!(slave.state, ConnState::Idle));
        assert!(slave.role.is_none());
    }

    #[test]
    fn master_listen_false_is_ignored_outside_listening() {
        let clock = SharedClock::new();
        let mut master: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        assert!(!master.master_listen(false));

        master.role = Some(Role::Master);
        master.state = ConnState::Connected;
        assert!(!master.master_listen(false));
        assert!(matches!(master.state, ConnState::Connected));
    }

    #[test]
    fn connect_while_already_connected_is_re_acked_without_disturbing_the_session() {
        let clock = SharedClock::new();
        let mut master: DlpEngine<NullBus, _, DefaultDlpTimings> = DlpEngine::new(NullBus, clock, DlpConfig::default());
        master.role = Some(Role::Master);
        master.state = ConnState::Connected;
        master.rx_seq = 4;
        master.tx_seq = 2;

        master.handle_u_frame(Address::SLAVE, UKind::Connect);

        assert!(matches!(master.control_queue.peek(), Some(Control::U { kind: UKind::ConnectAck })));
        assert_eq!(master.rx_seq, 4, "a repeat CONNECT must not reset the running session");
        assert_eq!(master.tx_seq, 2);
    }
}

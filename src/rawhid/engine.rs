//! Message reassembly, session state machine and dispatch.
//!
//! [`Engine::handle_packet`] runs in interrupt context and only
//! reassembles, verifies and replies. Execution happens in the
//! foreground: the main loop pulls a finished message with
//! [`Engine::take_message`], runs it through [`run_message`] with
//! interrupts free, and reports back with [`Engine::complete`]. New
//! packets keep being answered while a message executes.

use crc::{Crc, CRC_16_ARC};
use heapless::Vec;

use super::{
    pong_packet, status_packet, LayoutHook, MessageKind, PacketLink, SessionStatus, UpdateOps,
    PACKET_MSG_CONT, PACKET_MSG_START, PACKET_PING, PACKET_RESET_PROTO,
};
use crate::boot::FlashLayout;
use crate::config::{MSG_CAPACITY, MSG_CRC_SIZE, MSG_HEADER_SIZE, MSG_MAX_PAYLOAD, PAGE_SIZE};

/// CRC-16/ARC, the polynomial avr-libc's `_crc16_update` implements, so
/// host tooling can produce the trailer either way.
const MSG_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Smallest structurally valid message: header plus checksum.
const MSG_MIN_LEN: usize = MSG_HEADER_SIZE + MSG_CRC_SIZE;

/// A complete, checksum-verified message, copied out of the session
/// buffer for foreground execution.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    kind: u8,
    data: Vec<u8, MSG_MAX_PAYLOAD>,
}

impl Message {
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_code(self.kind)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

/// Result of executing one message, fed back into [`Engine::complete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Done,
    /// Reply and flush the link, then call
    /// [`UpdateOps::enter_bootloader`]; nothing runs afterwards.
    EnterDfu,
    Error(SessionStatus),
}

/// Protocol session: reassembly buffer plus status.
#[derive(Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Engine {
    status: SessionStatus,
    /// Declared total message length, valid while receiving.
    expected: usize,
    buf: Vec<u8, MSG_CAPACITY>,
    /// A message has been handed out and its outcome is still pending.
    dispatching: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

impl Engine {
    pub const fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            expected: 0,
            buf: Vec::new(),
            dispatching: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Feed one raw packet from the OUT endpoint.
    pub fn handle_packet<P: PacketLink>(&mut self, packet: &[u8], link: &mut P) {
        let Some((&header, payload)) = packet.split_first() else {
            return;
        };
        match header {
            PACKET_PING => {
                let _ = link.send(&pong_packet());
            }
            PACKET_RESET_PROTO => self.reset(),
            PACKET_MSG_START => self.msg_start(payload, link),
            PACKET_MSG_CONT => self.msg_cont(payload, link),
            // Reserved headers are ignored; hosts may probe newer
            // protocol revisions.
            _ => {}
        }
    }

    /// Unconditional return to IDLE, dropping any partial message. A
    /// dispatch in flight loses the session; its later outcome is
    /// swallowed by [`Engine::complete`].
    pub fn reset(&mut self) {
        self.status = SessionStatus::Idle;
        self.expected = 0;
        self.buf.clear();
        self.dispatching = false;
    }

    fn msg_start<P: PacketLink>(&mut self, payload: &[u8], link: &mut P) {
        if self.status == SessionStatus::Executing {
            // The running message keeps the session; only tell the host.
            self.report(SessionStatus::Busy, link);
            return;
        }
        self.buf.clear();
        let Some(total) = parse_total_len(payload) else {
            self.enter_error(SessionStatus::WrongMessage, link);
            return;
        };
        self.status = SessionStatus::Receiving;
        self.expected = total;
        self.append(payload, link);
    }

    fn msg_cont<P: PacketLink>(&mut self, payload: &[u8], link: &mut P) {
        match self.status {
            SessionStatus::Receiving => self.append(payload, link),
            // As with BUSY: report without disturbing the session.
            SessionStatus::Executing => self.report(SessionStatus::UnexpectedCont, link),
            _ => self.enter_error(SessionStatus::UnexpectedCont, link),
        }
    }

    /// Append up to the declared length, then finalize once complete.
    /// Excess bytes in the last packet are padding and are dropped.
    fn append<P: PacketLink>(&mut self, payload: &[u8], link: &mut P) {
        let remaining = self.expected - self.buf.len();
        let take = remaining.min(payload.len());
        // expected <= MSG_CAPACITY, checked at message start.
        let _ = self.buf.extend_from_slice(&payload[..take]);
        if self.buf.len() == self.expected {
            self.finalize(link);
        }
    }

    fn finalize<P: PacketLink>(&mut self, link: &mut P) {
        let total = self.expected;
        let body = &self.buf[MSG_HEADER_SIZE..total - MSG_CRC_SIZE];
        let stored = u16::from_le_bytes([self.buf[total - MSG_CRC_SIZE], self.buf[total - 1]]);
        if MSG_CRC.checksum(body) != stored {
            self.enter_error(SessionStatus::CrcError, link);
            return;
        }
        // No reply here; the host learns the outcome after execution.
        self.status = SessionStatus::Executing;
    }

    /// Hand out the completed message for foreground execution. Returns
    /// at most one copy per message.
    pub fn take_message(&mut self) -> Option<Message> {
        if self.status != SessionStatus::Executing || self.dispatching {
            return None;
        }
        self.dispatching = true;
        let total = self.expected;
        let kind = self.buf[0];
        let mut data = Vec::new();
        // Fits by construction: total <= MSG_CAPACITY.
        let _ = data.extend_from_slice(&self.buf[MSG_HEADER_SIZE..total - MSG_CRC_SIZE]);
        Some(Message { kind, data })
    }

    /// Report the dispatch outcome and release the session. Does nothing
    /// if a protocol reset took the session away mid-dispatch. Runs in
    /// the foreground and flushes a busy link before replying; this
    /// status packet is the only completion signal the host gets.
    pub fn complete<P: PacketLink>(&mut self, outcome: Outcome, link: &mut P) {
        if !self.dispatching {
            return;
        }
        self.dispatching = false;
        if self.status != SessionStatus::Executing {
            return;
        }
        match outcome {
            Outcome::Done | Outcome::EnterDfu => {
                self.status = SessionStatus::Idle;
                self.expected = 0;
                self.buf.clear();
            }
            Outcome::Error(status) => {
                #[cfg(feature = "defmt")]
                defmt::debug!("rawhid session error: {}", status);
                self.status = status;
            }
        }
        if link.send(&status_packet(self.status)).is_err() {
            link.flush();
            let _ = link.send(&status_packet(self.status));
        }
    }

    fn enter_error<P: PacketLink>(&mut self, status: SessionStatus, link: &mut P) {
        #[cfg(feature = "defmt")]
        defmt::debug!("rawhid session error: {}", status);
        self.status = status;
        self.report(status, link);
    }

    fn report<P: PacketLink>(&self, status: SessionStatus, link: &mut P) {
        let _ = link.send(&status_packet(status));
    }
}

/// Total message length from a start-packet payload, if structurally
/// valid: short enough for the buffer, long enough for header and
/// checksum.
fn parse_total_len(payload: &[u8]) -> Option<usize> {
    if payload.len() < MSG_HEADER_SIZE {
        return None;
    }
    let total = u16::from_le_bytes([payload[1], payload[2]]) as usize;
    if (MSG_MIN_LEN..=MSG_CAPACITY).contains(&total) {
        Some(total)
    } else {
        None
    }
}

/// Execute one message against the flash window, the bootloader bridge
/// and the layout hooks. Runs in the foreground with interrupts free;
/// packet traffic continues while this works.
pub fn run_message<O: UpdateOps, L: LayoutHook>(
    message: &Message,
    layout: &FlashLayout,
    ops: &mut O,
    hooks: &mut L,
) -> Outcome {
    match message.kind() {
        Some(MessageKind::Dfu) => Outcome::EnterDfu,
        Some(MessageKind::WritePage) => write_page(message.payload(), layout, ops),
        Some(MessageKind::ActivateLayout) => {
            if hooks.activate(message.payload()) {
                Outcome::Done
            } else {
                Outcome::Error(SessionStatus::WrongMessage)
            }
        }
        Some(MessageKind::DeactivateLayout) => {
            hooks.deactivate();
            Outcome::Done
        }
        None => Outcome::Error(SessionStatus::MessageError),
    }
}

fn write_page<O: UpdateOps>(payload: &[u8], layout: &FlashLayout, ops: &mut O) -> Outcome {
    if payload.len() != 4 + PAGE_SIZE {
        return Outcome::Error(SessionStatus::WrongMessage);
    }
    let address = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    // The window check runs before any flash call is marshaled.
    if layout.check_page_write(address).is_err() {
        return Outcome::Error(SessionStatus::WrongMessage);
    }
    let Ok(page) = payload[4..].try_into() else {
        return Outcome::Error(SessionStatus::WrongMessage);
    };
    match ops.write_page(address, page) {
        Ok(()) => Outcome::Done,
        Err(_) => Outcome::Error(SessionStatus::WrongMessage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RAWHID_PACKET_SIZE, RAWHID_PAYLOAD_SIZE};
    use crate::mock::{LayoutProbe, MockLink, UpdateProbe};

    const FLASHEND: u32 = 0x7FFF;
    const BOOT_SIZE: u32 = 4096;
    const FIRMWARE_END: u32 = 0x5000;

    fn layout() -> FlashLayout {
        FlashLayout::new(FLASHEND, BOOT_SIZE, FIRMWARE_END)
    }

    fn checksum(body: &[u8]) -> u16 {
        MSG_CRC.checksum(body)
    }

    /// Build the packet sequence carrying one message of the given kind
    /// and body.
    fn packets_for(kind: u8, body: &[u8]) -> std::vec::Vec<[u8; RAWHID_PACKET_SIZE]> {
        let total = MSG_HEADER_SIZE + body.len() + MSG_CRC_SIZE;
        assert!(total <= MSG_CAPACITY);
        let mut message = std::vec::Vec::new();
        message.push(kind);
        message.extend_from_slice(&(total as u16).to_le_bytes());
        message.extend_from_slice(body);
        message.extend_from_slice(&checksum(body).to_le_bytes());

        let mut packets = std::vec::Vec::new();
        for (i, chunk) in message.chunks(RAWHID_PAYLOAD_SIZE).enumerate() {
            let mut packet = [0u8; RAWHID_PACKET_SIZE];
            packet[0] = if i == 0 { PACKET_MSG_START } else { PACKET_MSG_CONT };
            packet[1..1 + chunk.len()].copy_from_slice(chunk);
            packets.push(packet);
        }
        packets
    }

    fn feed(engine: &mut Engine, link: &mut MockLink, packets: &[[u8; RAWHID_PACKET_SIZE]]) {
        for packet in packets {
            engine.handle_packet(packet, link);
        }
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let mut packet = [0u8; RAWHID_PACKET_SIZE];
        packet[0] = PACKET_PING;
        packet[5] = 0xEE; // payload is irrelevant
        engine.handle_packet(&packet, &mut link);
        assert_eq!(link.sent(), [pong_packet()]);
        assert_eq!(engine.status(), SessionStatus::Idle);
    }

    #[test]
    fn single_packet_message_reaches_executing_silently() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let packets = packets_for(MessageKind::Dfu as u8, &[]);
        assert_eq!(packets.len(), 1);
        feed(&mut engine, &mut link, &packets);
        assert_eq!(engine.status(), SessionStatus::Executing);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn multi_packet_message_reassembles() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let body: std::vec::Vec<u8> = (0..100).collect();
        let packets = packets_for(MessageKind::ActivateLayout as u8, &body);
        assert!(packets.len() > 1);

        feed(&mut engine, &mut link, &packets[..packets.len() - 1]);
        assert_eq!(engine.status(), SessionStatus::Receiving);

        engine.handle_packet(&packets[packets.len() - 1], &mut link);
        assert_eq!(engine.status(), SessionStatus::Executing);

        let message = engine.take_message().unwrap();
        assert_eq!(message.kind(), Some(MessageKind::ActivateLayout));
        assert_eq!(message.payload(), &body[..]);
    }

    #[test]
    fn padding_after_declared_length_is_dropped() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let packets = packets_for(MessageKind::ActivateLayout as u8, &[7]);
        // Only one packet; its tail beyond total_len is padding.
        feed(&mut engine, &mut link, &packets);
        let message = engine.take_message().unwrap();
        assert_eq!(message.payload(), &[7]);
    }

    #[test]
    fn corrupt_checksum_reports_crc_error() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let mut packets = packets_for(MessageKind::Dfu as u8, &[1, 2, 3]);
        let last = packets.len() - 1;
        // Flip a payload bit; the stored checksum no longer matches.
        packets[last][4] ^= 0x01;
        feed(&mut engine, &mut link, &packets);
        assert_eq!(engine.status(), SessionStatus::CrcError);
        assert_eq!(link.sent(), [status_packet(SessionStatus::CrcError)]);
        assert!(engine.take_message().is_none());
    }

    #[test]
    fn bad_total_len_reports_wrong_message() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        for bad_total in [0u16, 4, (MSG_CAPACITY + 1) as u16] {
            let mut packet = [0u8; RAWHID_PACKET_SIZE];
            packet[0] = PACKET_MSG_START;
            packet[1] = MessageKind::Dfu as u8;
            packet[2..4].copy_from_slice(&bad_total.to_le_bytes());
            engine.handle_packet(&packet, &mut link);
            assert_eq!(engine.status(), SessionStatus::WrongMessage);
            engine.reset();
            link.clear();
        }
    }

    #[test]
    fn unexpected_continuation_reported_and_buffer_untouched() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let mut packet = [0u8; RAWHID_PACKET_SIZE];
        packet[0] = PACKET_MSG_CONT;
        packet[1] = 0xAA;
        engine.handle_packet(&packet, &mut link);
        assert_eq!(engine.status(), SessionStatus::UnexpectedCont);
        assert_eq!(link.sent(), [status_packet(SessionStatus::UnexpectedCont)]);

        // A fresh message start recovers the session.
        link.clear();
        let packets = packets_for(MessageKind::Dfu as u8, &[]);
        feed(&mut engine, &mut link, &packets);
        assert_eq!(engine.status(), SessionStatus::Executing);
    }

    #[test]
    fn unknown_packet_headers_are_ignored() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let mut packet = [0u8; RAWHID_PACKET_SIZE];
        packet[0] = 0x7F;
        engine.handle_packet(&packet, &mut link);
        assert_eq!(engine.status(), SessionStatus::Idle);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn empty_packet_is_ignored() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        engine.handle_packet(&[], &mut link);
        assert_eq!(engine.status(), SessionStatus::Idle);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn reset_proto_is_silent_and_unconditional() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let body: std::vec::Vec<u8> = (0..60).collect();
        let packets = packets_for(MessageKind::ActivateLayout as u8, &body);
        feed(&mut engine, &mut link, &packets[..1]);
        assert_eq!(engine.status(), SessionStatus::Receiving);

        let mut reset = [0u8; RAWHID_PACKET_SIZE];
        reset[0] = PACKET_RESET_PROTO;
        engine.handle_packet(&reset, &mut link);
        assert_eq!(engine.status(), SessionStatus::Idle);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn take_message_returns_one_copy() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        assert!(engine.take_message().is_some());
        assert!(engine.take_message().is_none());
        assert_eq!(engine.status(), SessionStatus::Executing);
    }

    #[test]
    fn new_message_while_executing_reports_busy() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let _ = engine.take_message();

        link.clear();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::DeactivateLayout as u8, &[]),
        );
        assert_eq!(link.sent(), [status_packet(SessionStatus::Busy)]);
        assert_eq!(engine.status(), SessionStatus::Executing);

        // The original message still completes normally.
        engine.complete(Outcome::Done, &mut link);
        assert_eq!(engine.status(), SessionStatus::Idle);
    }

    #[test]
    fn continuation_while_executing_reports_without_corruption() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let message = engine.take_message().unwrap();

        link.clear();
        let mut cont = [0u8; RAWHID_PACKET_SIZE];
        cont[0] = PACKET_MSG_CONT;
        engine.handle_packet(&cont, &mut link);
        assert_eq!(link.sent(), [status_packet(SessionStatus::UnexpectedCont)]);
        assert_eq!(engine.status(), SessionStatus::Executing);
        assert_eq!(message.kind(), Some(MessageKind::Dfu));
    }

    #[test]
    fn complete_done_reports_idle() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::DeactivateLayout as u8, &[]),
        );
        let _ = engine.take_message();
        link.clear();
        engine.complete(Outcome::Done, &mut link);
        assert_eq!(engine.status(), SessionStatus::Idle);
        assert_eq!(link.sent(), [status_packet(SessionStatus::Idle)]);
    }

    #[test]
    fn complete_error_reports_and_holds_error_state() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::WritePage as u8, &[0; 10]),
        );
        let _ = engine.take_message();
        link.clear();
        engine.complete(Outcome::Error(SessionStatus::WrongMessage), &mut link);
        assert_eq!(engine.status(), SessionStatus::WrongMessage);
        assert_eq!(link.sent(), [status_packet(SessionStatus::WrongMessage)]);
    }

    #[test]
    fn completion_reply_drains_a_busy_link() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let _ = engine.take_message();
        link.clear();

        // Both banks still hold earlier replies when the outcome lands.
        link.set_busy(true);
        engine.complete(Outcome::EnterDfu, &mut link);
        assert_eq!(link.flushes(), 1);
        assert_eq!(link.sent(), [status_packet(SessionStatus::Idle)]);
        assert_eq!(engine.status(), SessionStatus::Idle);
    }

    #[test]
    fn reset_during_dispatch_swallows_the_outcome() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let _ = engine.take_message();

        let mut reset = [0u8; RAWHID_PACKET_SIZE];
        reset[0] = PACKET_RESET_PROTO;
        engine.handle_packet(&reset, &mut link);

        link.clear();
        engine.complete(Outcome::Done, &mut link);
        assert!(link.sent().is_empty());
        assert_eq!(engine.status(), SessionStatus::Idle);
    }

    #[test]
    fn dispatch_outcome_cannot_claim_a_successor_message() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let _ = engine.take_message();

        // Host resets and lands a whole new message before the old
        // dispatch reports back.
        let mut reset = [0u8; RAWHID_PACKET_SIZE];
        reset[0] = PACKET_RESET_PROTO;
        engine.handle_packet(&reset, &mut link);
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::DeactivateLayout as u8, &[]),
        );
        assert_eq!(engine.status(), SessionStatus::Executing);

        link.clear();
        engine.complete(Outcome::Done, &mut link);
        // The stale outcome is dropped; the new message is still there.
        assert!(link.sent().is_empty());
        assert!(engine.take_message().is_some());
    }

    #[test]
    fn run_dfu_requests_bootloader_entry() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::Dfu as u8, &[]),
        );
        let message = engine.take_message().unwrap();
        let outcome = run_message(&message, &layout(), &mut ops, &mut hooks);
        assert_eq!(outcome, Outcome::EnterDfu);
        // Entry itself is the caller's last step, after the reply.
        assert!(!ops.entered());
    }

    #[test]
    fn run_write_page_passes_address_and_data() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        let mut body = std::vec::Vec::new();
        body.extend_from_slice(&FIRMWARE_END.to_le_bytes());
        body.extend_from_slice(&[0xC3; PAGE_SIZE]);
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::WritePage as u8, &body),
        );
        let message = engine.take_message().unwrap();
        let outcome = run_message(&message, &layout(), &mut ops, &mut hooks);
        assert_eq!(outcome, Outcome::Done);
        let pages = ops.pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].0, FIRMWARE_END);
        assert_eq!(pages[0].1, [0xC3; PAGE_SIZE]);
    }

    #[test]
    fn write_page_with_short_payload_is_refused() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        let message = {
            let mut engine = Engine::new();
            let mut link = MockLink::new();
            feed(
                &mut engine,
                &mut link,
                &packets_for(MessageKind::WritePage as u8, &[0; 16]),
            );
            engine.take_message().unwrap()
        };
        let outcome = run_message(&message, &layout(), &mut ops, &mut hooks);
        assert_eq!(outcome, Outcome::Error(SessionStatus::WrongMessage));
        assert!(ops.pages().is_empty());
    }

    #[test]
    fn write_page_outside_window_never_reaches_flash() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        // Bootloader-resident page.
        let mut body = std::vec::Vec::new();
        body.extend_from_slice(&0x7000u32.to_le_bytes());
        body.extend_from_slice(&[0; PAGE_SIZE]);
        let message = {
            let mut engine = Engine::new();
            let mut link = MockLink::new();
            feed(
                &mut engine,
                &mut link,
                &packets_for(MessageKind::WritePage as u8, &body),
            );
            engine.take_message().unwrap()
        };
        let outcome = run_message(&message, &layout(), &mut ops, &mut hooks);
        assert_eq!(outcome, Outcome::Error(SessionStatus::WrongMessage));
        assert!(ops.pages().is_empty());
    }

    #[test]
    fn layout_messages_drive_the_hooks() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        let mut engine = Engine::new();
        let mut link = MockLink::new();

        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::ActivateLayout as u8, &[1]),
        );
        let message = engine.take_message().unwrap();
        assert_eq!(
            run_message(&message, &layout(), &mut ops, &mut hooks),
            Outcome::Done
        );
        assert_eq!(hooks.activations(), [&[1u8][..]]);
        engine.complete(Outcome::Done, &mut link);

        feed(
            &mut engine,
            &mut link,
            &packets_for(MessageKind::DeactivateLayout as u8, &[]),
        );
        let message = engine.take_message().unwrap();
        assert_eq!(
            run_message(&message, &layout(), &mut ops, &mut hooks),
            Outcome::Done
        );
        assert_eq!(hooks.deactivations(), 1);
    }

    #[test]
    fn refused_layout_activation_is_an_error() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        hooks.refuse();
        let message = {
            let mut engine = Engine::new();
            let mut link = MockLink::new();
            feed(
                &mut engine,
                &mut link,
                &packets_for(MessageKind::ActivateLayout as u8, &[9]),
            );
            engine.take_message().unwrap()
        };
        assert_eq!(
            run_message(&message, &layout(), &mut ops, &mut hooks),
            Outcome::Error(SessionStatus::WrongMessage)
        );
    }

    #[test]
    fn unknown_message_kind_is_a_message_error() {
        let mut ops = UpdateProbe::new();
        let mut hooks = LayoutProbe::new();
        let message = {
            let mut engine = Engine::new();
            let mut link = MockLink::new();
            feed(&mut engine, &mut link, &packets_for(0x77, &[]));
            engine.take_message().unwrap()
        };
        assert_eq!(
            run_message(&message, &layout(), &mut ops, &mut hooks),
            Outcome::Error(SessionStatus::MessageError)
        );
    }

    #[test]
    fn largest_message_fills_the_buffer_exactly() {
        let mut engine = Engine::new();
        let mut link = MockLink::new();
        let body = [0x5A; MSG_CAPACITY - MSG_MIN_LEN];
        let packets = packets_for(MessageKind::ActivateLayout as u8, &body);
        feed(&mut engine, &mut link, &packets);
        assert_eq!(engine.status(), SessionStatus::Executing);
        let message = engine.take_message().unwrap();
        assert_eq!(message.payload().len(), MSG_MAX_PAYLOAD);
    }
}

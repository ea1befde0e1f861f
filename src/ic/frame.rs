//! IC frame header (spec.md §4.4): a fixed 12-byte header followed by
//! `data_length` bytes of payload, all little-endian.
//!
//! ```text
//! off 0 : flags:8  reserved:24     (flags byte is most-significant)
//! off 4 : command:32
//! off 8 : data_length:32  (top bit reserved, MUST be 0 on emit)
//! off 12: payload[data_length]
//! ```
//!
//! Bit layout of the reserved 24-bit field and the stream-control
//! sentinel command value are carried over verbatim from
//! `original_source/iop-rpc-channel.h`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{IcError, IcStatus};

pub const HEADER_LEN: usize = 12;

/// Sentinel `command` value marking a stream-control frame rather than
/// a query or reply (spec.md §4.4).
pub const STREAM_CONTROL_COMMAND: u32 = 0x8000_0000;

/// `data_length`'s top bit is reserved and must be zero on emit.
const DATA_LENGTH_RESERVED_MASK: u32 = 0x8000_0000;

/// Wire-field width a slot id is masked into before it's placed in a
/// frame header (`IC_MSG_SLOT_MASK`, `iop-rpc-channel.h:317`): the low
/// 24 bits of the reserved field.
pub const SLOT_MASK: u32 = 0x00FF_FFFF;

/// Generator modulus for [`SlotIdGenerator`]'s internal counter
/// (`IC_ID_MAX`, `iop-rpc-channel.h:316`): a 30-bit wrap, skipping
/// zero. Distinct from [`SLOT_MASK`] — the counter runs wider than the
/// 24-bit wire field it's masked into on emit.
pub const ID_MAX: u32 = 1 << 30;

bitflags::bitflags! {
    /// The flags byte. `PRIORITY` occupies bits 3-4 (2 bits); the
    /// remaining bits are `HAS_FD`, `HAS_HDR`, `IS_TRACED`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const HAS_FD    = 0b0000_0001;
        const HAS_HDR   = 0b0000_0010;
        const IS_TRACED = 0b0000_0100;
        const PRIORITY_LOW_BIT  = 0b0000_1000;
        const PRIORITY_HIGH_BIT = 0b0001_0000;
    }
}

/// Send priority, packed into the flags byte's 2-bit `PRIORITY` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }

    fn to_bits(self) -> u8 {
        self as u8
    }
}

impl Flags {
    pub fn priority(self) -> Priority {
        Priority::from_bits((self.bits() >> 3) & 0b11)
    }

    pub fn with_priority(mut self, p: Priority) -> Self {
        self.remove(Flags::PRIORITY_LOW_BIT | Flags::PRIORITY_HIGH_BIT);
        self.insert(Flags::from_bits_retain(p.to_bits() << 3));
        self
    }
}

/// A query's `command` is `(interface << 16) | rpc`, both 15-bit
/// subfields with their top bits reserved zero (spec.md §4.4). A reply
/// or stream-control frame uses `command` for a status/sentinel value
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `command = (interface << 16) | rpc`.
    Query { interface: u16, rpc: u16 },
    /// Negative or zero, carrying an [`IcStatus`] in its low bits.
    Reply(IcStatus),
    StreamControl(StreamControl),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Peer shutdown notice.
    Bye,
    /// Legacy no-op, used by the watchdog to synthesize keepalive traffic.
    Nop,
    /// `(version, wants_tls)`; always the first frame on a TCP channel.
    Version(u16, bool),
}

const SC_BYE: u32 = 1;
const SC_NOP: u32 = 2;
const SC_VERSION: u32 = 3;
const SC_TLS_FLAG: u32 = 0x0001_0000;

pub fn encode_command(cmd: Command) -> u32 {
    match cmd {
        Command::Query { interface, rpc } => {
            ((interface as u32 & 0x7FFF) << 16) | (rpc as u32 & 0x7FFF)
        }
        Command::Reply(status) => (status.as_i32() as u32) | 0x4000_0000,
        Command::StreamControl(sc) => {
            let sub = match sc {
                StreamControl::Bye => SC_BYE,
                StreamControl::Nop => SC_NOP,
                StreamControl::Version(version, tls) => {
                    SC_VERSION | ((version as u32) << 17) | if tls { SC_TLS_FLAG } else { 0 }
                }
            };
            STREAM_CONTROL_COMMAND | sub
        }
    }
}

pub fn decode_command(raw: u32) -> Result<Command, IcError> {
    if raw & STREAM_CONTROL_COMMAND != 0 {
        let sub = raw & !STREAM_CONTROL_COMMAND;
        return Ok(Command::StreamControl(match sub & 0xFFFF {
            SC_BYE => StreamControl::Bye,
            SC_NOP => StreamControl::Nop,
            SC_VERSION => {
                let version = ((sub >> 17) & 0xFFFF) as u16;
                let tls = sub & SC_TLS_FLAG != 0;
                StreamControl::Version(version, tls)
            }
            other => {
                return Err(IcError::invalid(format!(
                    "unknown stream-control sub-command {other:#x}"
                )))
            }
        }));
    }
    if raw & 0x4000_0000 != 0 || (raw as i32) <= 0 {
        let status = IcStatus::from_i32((raw & 0x0FFF_FFFF) as i32)
            .ok_or_else(|| IcError::invalid(format!("unknown reply status {raw:#x}")))?;
        return Ok(Command::Reply(status));
    }
    let interface = ((raw >> 16) & 0x7FFF) as u16;
    let rpc = (raw & 0x7FFF) as u16;
    Ok(Command::Query { interface, rpc })
}

/// The 12-byte frame header, parsed from / serialized to wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: Flags,
    /// Low 24 bits: the slot correlation id. Spec.md §4.4: "a query
    /// reserves the low 24 bits of its slot ... as a correlation id
    /// placed in the reserved-24 field; a reply echoes it."
    pub slot: u32,
    pub command: u32,
    pub data_length: u32,
}

impl FrameHeader {
    pub fn new(flags: Flags, slot: u32, command: u32, data_length: u32) -> Result<Self, IcError> {
        if slot & !SLOT_MASK != 0 {
            return Err(IcError::invalid("slot id exceeds 24 bits"));
        }
        if data_length & DATA_LENGTH_RESERVED_MASK != 0 {
            return Err(IcError::invalid("data_length's reserved top bit must be zero"));
        }
        Ok(Self {
            flags,
            slot,
            command,
            data_length,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.flags.bits();
        LittleEndian::write_u24(&mut buf[1..4], self.slot);
        LittleEndian::write_u32(&mut buf[4..8], self.command);
        LittleEndian::write_u32(&mut buf[8..12], self.data_length);
        buf
    }

    /// Parses a header from exactly [`HEADER_LEN`] bytes. Rejects a set
    /// reserved bit in `data_length` (spec.md §4.4 invariant: "a reader
    /// that observes it must reject the frame").
    pub fn decode(bytes: &[u8]) -> Result<Self, IcError> {
        if bytes.len() != HEADER_LEN {
            return Err(IcError::invalid(format!(
                "frame header must be {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let flags = Flags::from_bits_retain(bytes[0]);
        let slot = LittleEndian::read_u24(&bytes[1..4]);
        let command = LittleEndian::read_u32(&bytes[4..8]);
        let data_length = LittleEndian::read_u32(&bytes[8..12]);
        if data_length & DATA_LENGTH_RESERVED_MASK != 0 {
            return Err(IcError::invalid("data_length's reserved top bit is set"));
        }
        Ok(Self {
            flags,
            slot,
            command,
            data_length,
        })
    }
}

/// Monotonic slot-id generator: an internal counter wraps modulo
/// [`ID_MAX`] (30 bits), skipping zero; [`next_id`](Self::next_id)
/// masks that counter to [`SLOT_MASK`] (24 bits) before handing it out
/// for use in a wire `slot` field (spec.md §4.4).
#[derive(Debug, Default)]
pub struct SlotIdGenerator {
    next: u32,
}

impl SlotIdGenerator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next_id(&mut self) -> u32 {
        loop {
            self.next = (self.next + 1) % ID_MAX;
            if self.next == 0 {
                self.next = 1;
            }
            let wire = self.next & SLOT_MASK;
            if wire != 0 {
                return wire;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let h = FrameHeader::new(Flags::HAS_HDR, 42, 0x0001_0002, 128).unwrap();
        let bytes = h.encode();
        let decoded = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn data_length_reserved_bit_is_rejected_on_decode() {
        let mut bytes = FrameHeader::new(Flags::empty(), 0, 0, 0).unwrap().encode();
        bytes[11] |= 0x80;
        assert!(FrameHeader::decode(&bytes).is_err());
    }

    #[test]
    fn query_command_roundtrips() {
        let cmd = Command::Query { interface: 7, rpc: 3 };
        let raw = encode_command(cmd);
        assert_eq!(decode_command(raw).unwrap(), cmd);
    }

    #[test]
    fn stream_control_version_roundtrips() {
        let cmd = Command::StreamControl(StreamControl::Version(1, true));
        let raw = encode_command(cmd);
        assert_eq!(decode_command(raw).unwrap(), cmd);
    }

    #[test]
    fn slot_generator_skips_zero_on_wrap() {
        let mut gen = SlotIdGenerator::new();
        gen.next = ID_MAX - 1;
        // The increment lands on ID_MAX (== 0 mod ID_MAX); the
        // generator must skip straight past it to 1.
        assert_eq!(gen.next_id(), 1);
        assert_eq!(gen.next_id(), 2);
    }

    #[test]
    fn slot_generator_counts_wider_than_the_wire_mask() {
        // The internal counter ranges over 30 bits, six more than the
        // 24-bit wire field it's masked into.
        let mut gen = SlotIdGenerator::new();
        gen.next = SLOT_MASK;
        assert_eq!(gen.next_id(), (SLOT_MASK + 1) & SLOT_MASK);
        assert_eq!(gen.next, SLOT_MASK + 1);
    }

    #[test]
    fn next_id_never_returns_zero() {
        // next advances from 2^24 - 1 to 2^24, whose low 24 bits are
        // all zero; the generator must keep advancing past it.
        let mut gen = SlotIdGenerator::new();
        gen.next = (1 << 24) - 1;
        let wire = gen.next_id();
        assert_ne!(wire, 0);
        assert_eq!(wire, 1);
        assert_eq!(gen.next, (1 << 24) + 1);
    }
}

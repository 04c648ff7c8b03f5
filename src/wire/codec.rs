// Message encoding and decoding for the wire protocol
//
// All integers are little-endian. Each record starts with a one-byte message
// type tag followed by a fixed-layout payload; ListResponse additionally
// carries a u32 member count. Datagrams are concatenations of records with
// no length prefix, so `parse` consumes exactly one record from the front of
// the buffer and reports how many bytes it used.

use crate::error::{GossipError, Result};
use crate::wire::{
    Incarnation, MemberState, Message, MessageType, NodeAddress, WireMember,
};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv6Addr};

/// Largest record a probe-cycle primary can be (IndirectPing / Suspect /
/// Faulty): tag + two addresses + u16.
pub const MAX_PROBE_RECORD_LEN: usize = 1 + 2 * NodeAddress::WIRE_LEN + 2;

/// Encoded size of a message, used by the sender to truncate the piggyback
/// loop before a record would exceed the datagram limit.
pub fn encoded_len(message: &Message) -> usize {
    match message {
        Message::DirectPing { .. }
        | Message::DirectAck { .. }
        | Message::IndirectAck { .. }
        | Message::Alive { .. } => 1 + NodeAddress::WIRE_LEN + 2,
        Message::IndirectPing { .. }
        | Message::Suspect { .. }
        | Message::Faulty { .. } => MAX_PROBE_RECORD_LEN,
        Message::ListRequest { .. } => 1 + NodeAddress::WIRE_LEN,
        Message::ListResponse { members, .. } => {
            1 + NodeAddress::WIRE_LEN + 4 + members.len() * WireMember::WIRE_LEN
        }
    }
}

/// Append one encoded record to `buf`, returning the number of bytes
/// written. The buffer is only ever grown; nothing before the append point
/// is touched.
pub fn append(buf: &mut BytesMut, message: &Message) -> Result<usize> {
    let start = buf.len();
    buf.reserve(encoded_len(message));
    buf.put_u8(message.message_type().as_u8());

    match message {
        Message::DirectPing { src, seq } | Message::DirectAck { src, seq } => {
            put_address(buf, src)?;
            buf.put_u16_le(*seq);
        }
        Message::IndirectPing { src, dst, seq } => {
            put_address(buf, src)?;
            put_address(buf, dst)?;
            buf.put_u16_le(*seq);
        }
        Message::IndirectAck { src, seq } => {
            put_address(buf, src)?;
            buf.put_u16_le(*seq);
        }
        Message::Suspect {
            src,
            dst,
            incarnation,
        }
        | Message::Faulty {
            src,
            dst,
            incarnation,
        } => {
            put_address(buf, src)?;
            put_address(buf, dst)?;
            buf.put_u16_le(incarnation.0);
        }
        Message::Alive { dst, incarnation } => {
            put_address(buf, dst)?;
            buf.put_u16_le(incarnation.0);
        }
        Message::ListRequest { src } => {
            put_address(buf, src)?;
        }
        Message::ListResponse { src, members } => {
            put_address(buf, src)?;
            let count = u32::try_from(members.len()).map_err(|_| {
                GossipError::Encode("member list exceeds u32 count".into())
            })?;
            buf.put_u32_le(count);
            for member in members {
                put_address(buf, &member.address)?;
                buf.put_u8(member.state.as_u8());
                buf.put_u16_le(member.incarnation.0);
            }
        }
    }

    Ok(buf.len() - start)
}

fn put_address(buf: &mut BytesMut, address: &NodeAddress) -> Result<()> {
    // The constructor forbids port 0, but addresses can also arrive through
    // deserialized configuration; never let an invalid one reach the wire.
    if address.port() == 0 {
        return Err(GossipError::Encode("address port must be non-zero".into()));
    }
    buf.put_slice(&address.ip().octets());
    buf.put_u16_le(address.port());
    Ok(())
}

/// Parse one record from the front of `buf`. Returns the message and the
/// number of bytes consumed so callers can walk concatenated records.
/// Malformed input yields a bounded error; the parser never panics.
pub fn parse(buf: &[u8]) -> Result<(Message, usize)> {
    let mut reader = Reader::new(buf);
    let tag = MessageType::from_u8(reader.u8()?)?;

    let message = match tag {
        MessageType::DirectPing => {
            let src = reader.address()?;
            let seq = reader.u16_le()?;
            Message::DirectPing { src, seq }
        }
        MessageType::DirectAck => {
            let src = reader.address()?;
            let seq = reader.u16_le()?;
            Message::DirectAck { src, seq }
        }
        MessageType::IndirectPing => {
            let src = reader.address()?;
            let dst = reader.address()?;
            let seq = reader.u16_le()?;
            Message::IndirectPing { src, dst, seq }
        }
        MessageType::IndirectAck => {
            let src = reader.address()?;
            let seq = reader.u16_le()?;
            Message::IndirectAck { src, seq }
        }
        MessageType::Suspect => {
            let src = reader.address()?;
            let dst = reader.address()?;
            let incarnation = Incarnation(reader.u16_le()?);
            Message::Suspect {
                src,
                dst,
                incarnation,
            }
        }
        MessageType::Alive => {
            let dst = reader.address()?;
            let incarnation = Incarnation(reader.u16_le()?);
            Message::Alive { dst, incarnation }
        }
        MessageType::Faulty => {
            let src = reader.address()?;
            let dst = reader.address()?;
            let incarnation = Incarnation(reader.u16_le()?);
            Message::Faulty {
                src,
                dst,
                incarnation,
            }
        }
        MessageType::ListRequest => {
            let src = reader.address()?;
            Message::ListRequest { src }
        }
        MessageType::ListResponse => {
            let src = reader.address()?;
            let count = reader.u32_le()? as usize;
            let needed = count
                .checked_mul(WireMember::WIRE_LEN)
                .ok_or_else(|| GossipError::Decode("member count overflow".into()))?;
            reader.need(needed)?;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let address = reader.address()?;
                let state = MemberState::from_u8(reader.u8()?)?;
                let incarnation = Incarnation(reader.u16_le()?);
                members.push(WireMember {
                    address,
                    state,
                    incarnation,
                });
            }
            Message::ListResponse { src, members }
        }
    };

    Ok((message, reader.consumed()))
}

/// Bounds-checked cursor over a record buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.buf.len() - self.pos < len {
            return Err(GossipError::Decode(format!(
                "buffer too short: need {} more bytes, have {}",
                len,
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn u16_le(&mut self) -> Result<u16> {
        self.need(2)?;
        let value = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn u32_le(&mut self) -> Result<u32> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn address(&mut self) -> Result<NodeAddress> {
        self.need(NodeAddress::WIRE_LEN)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buf[self.pos..self.pos + 16]);
        self.pos += 16;
        let port = self.u16_le()?;
        if port == 0 {
            return Err(GossipError::Decode("address port must be non-zero".into()));
        }
        NodeAddress::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            .map_err(|e| GossipError::Decode(e.to_string()))
    }
}

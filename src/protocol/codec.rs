//! Frame codec for MQTT 3.1 / 3.1.1.
//!
//! `decode` turns the front of a byte buffer into a typed `Packet` and the
//! number of bytes it occupied, reports that more data is needed, or fails
//! with a `ProtocolError` when the bytes cannot be a valid packet. `encode`
//! produces the exact wire form of a `Packet`.
//!
//! The fixed header is one type/flags byte followed by the "remaining
//! length", a base-128 variable byte integer of one to four bytes. All
//! multi-byte integers are big-endian and all strings are prefixed with a
//! two-byte length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packet::{
    Connack, ConnackCode, Connect, LastWill, Packet, PacketType, ProtocolVersion, Publish, QoS,
    Suback, Subscribe, Unsubscribe,
};
use crate::utils::ProtocolError;

/// Largest value the four-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode the remaining-length field from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` if the
/// terminating byte has not arrived yet, or an error if four bytes were read
/// and all of them had the continuation bit set.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        Err(ProtocolError::InvalidRemainingLength)
    } else {
        Ok(None)
    }
}

/// Append `len` as a variable byte integer.
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) {
    debug_assert!(len <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode one packet from the front of `buf`.
///
/// `Ok(None)` means the buffer holds only a prefix of a packet.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;

    let Some((remaining, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[1 + len_bytes..total];
    let packet = decode_body(packet_type, flags, body)?;
    Ok(Some((packet, total)))
}

fn decode_body(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Packet, ProtocolError> {
    check_flags(packet_type, flags)?;

    let mut d = Decoder::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut d)?),
        PacketType::Connack => {
            let ack_flags = d.read_u8()?;
            if ack_flags & 0xFE != 0 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "reserved CONNACK flags {ack_flags:#04x}"
                )));
            }
            let code = ConnackCode::try_from(d.read_u8()?)?;
            Packet::Connack(Connack {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut d)?),
        PacketType::Puback => Packet::Puback {
            packet_id: d.read_u16()?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: d.read_u16()?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: d.read_u16()?,
            dup: flags & 0x08 != 0,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: d.read_u16()?,
        },
        PacketType::Subscribe => {
            let packet_id = d.read_u16()?;
            let mut filters = Vec::new();
            while !d.is_empty() {
                let filter = d.read_string()?;
                let requested = d.read_u8()?;
                if requested & 0xFC != 0 {
                    return Err(ProtocolError::MalformedPacket(format!(
                        "reserved bits set in requested QoS byte {requested:#04x}"
                    )));
                }
                filters.push((filter, QoS::try_from(requested)?));
            }
            if filters.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "SUBSCRIBE without topic filters".into(),
                ));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::Suback => {
            let packet_id = d.read_u16()?;
            let return_codes = d.rest().to_vec();
            if return_codes.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "SUBACK without return codes".into(),
                ));
            }
            if let Some(bad) = return_codes
                .iter()
                .find(|c| !matches!(**c, 0x00 | 0x01 | 0x02 | 0x80))
            {
                return Err(ProtocolError::MalformedPacket(format!(
                    "invalid SUBACK return code {bad:#04x}"
                )));
            }
            Packet::Suback(Suback {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = d.read_u16()?;
            let mut filters = Vec::new();
            while !d.is_empty() {
                filters.push(d.read_string()?);
            }
            if filters.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "UNSUBSCRIBE without topic filters".into(),
                ));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: d.read_u16()?,
        },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if !d.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} trailing bytes after {:?} body",
            d.remaining(),
            packet_type
        )));
    }
    Ok(packet)
}

fn check_flags(packet_type: PacketType, flags: u8) -> Result<(), ProtocolError> {
    let valid = match packet_type {
        PacketType::Publish => true,
        // qos bits fixed at 01, dup allowed on retransmit
        PacketType::Pubrel => flags & 0x07 == 0x02,
        PacketType::Subscribe | PacketType::Unsubscribe => flags == 0x02,
        _ => flags == 0,
    };
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFlags {
            packet_type: packet_type as u8,
            flags,
        })
    }
}

fn decode_connect(d: &mut Decoder<'_>) -> Result<Connect, ProtocolError> {
    let name = d.read_string()?;
    let level = d.read_u8()?;
    let protocol = match name.as_str() {
        "MQIsdp" if level == 3 => ProtocolVersion::V31,
        "MQTT" if level == 4 => ProtocolVersion::V311,
        "MQIsdp" | "MQTT" => return Err(ProtocolError::UnsupportedProtocolVersion(level)),
        _ => return Err(ProtocolError::InvalidProtocolName(name.clone())),
    };

    let flags = d.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::MalformedPacket(
            "reserved CONNECT flag set".into(),
        ));
    }
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if protocol == ProtocolVersion::V311 && password_flag && !username_flag {
        return Err(ProtocolError::MalformedPacket(
            "password flag set without username flag".into(),
        ));
    }
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::MalformedPacket(
            "will QoS/retain set without will flag".into(),
        ));
    }

    let keep_alive = d.read_u16()?;
    let client_id = d.read_string()?;

    let will = if will_flag {
        let topic = d.read_string()?;
        let payload = Bytes::copy_from_slice(d.read_binary()?);
        Some(LastWill {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(d.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(Bytes::copy_from_slice(d.read_binary()?))
    } else {
        None
    };

    Ok(Connect {
        protocol,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, d: &mut Decoder<'_>) -> Result<Publish, ProtocolError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let topic = d.read_string()?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        let id = d.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket(
                "packet identifier 0 on QoS>0 PUBLISH".into(),
            ));
        }
        Some(id)
    };

    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(d.rest()),
    })
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| {
            ProtocolError::MalformedPacket("body shorter than its fields".into())
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::MalformedPacket(format!(
                "need {len} bytes, {} left in body",
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_binary(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_binary()?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "string contains a null character".into(),
            ));
        }
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Encode `packet` into a freshly allocated buffer.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(packet, &mut buf);
    buf.freeze()
}

/// Append the wire form of `packet` to `buf`.
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) {
    let mut body = BytesMut::new();
    let flags: u8 = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body);
            0
        }
        Packet::Connack(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.code as u8);
            0
        }
        Packet::Publish(publish) => {
            debug_assert_eq!(
                publish.packet_id.is_some(),
                publish.qos != QoS::AtMostOnce,
                "PUBLISH carries a packet id iff QoS > 0"
            );
            put_string(&mut body, &publish.topic);
            if let Some(id) = publish.packet_id {
                body.put_u16(id);
            }
            body.put_slice(&publish.payload);
            (u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain)
        }
        Packet::Puback { packet_id }
        | Packet::Pubrec { packet_id }
        | Packet::Pubcomp { packet_id }
        | Packet::Unsuback { packet_id } => {
            body.put_u16(*packet_id);
            0
        }
        Packet::Pubrel { packet_id, dup } => {
            body.put_u16(*packet_id);
            0x02 | (u8::from(*dup) << 3)
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter);
                body.put_u8(*qos as u8);
            }
            0x02
        }
        Packet::Suback(suback) => {
            body.put_u16(suback.packet_id);
            body.put_slice(&suback.return_codes);
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter);
            }
            0x02
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => 0,
    };

    buf.reserve(body.len() + 5);
    buf.put_u8(((packet.packet_type() as u8) << 4) | flags);
    encode_remaining_length(body.len(), buf);
    buf.put_slice(&body);
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) {
    put_string(body, connect.protocol.name());
    body.put_u8(connect.protocol.level());

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_string(body, &connect.client_id);

    if let Some(will) = &connect.will {
        put_string(body, &will.topic);
        put_binary(body, &will.payload);
    }
    if let Some(username) = &connect.username {
        put_string(body, username);
    }
    if let Some(password) = &connect.password {
        put_binary(body, password);
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_binary(buf, s.as_bytes());
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

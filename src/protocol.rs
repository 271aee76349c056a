//! Wire formats for audio datagrams and control commands
//!
//! ## Audio packet format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ sender_id | seq | timestamp | vad | <opaque encoded payload> │
//! │   ASCII      u16     u32      0/1                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The first four fields are ASCII, pipe-separated; everything after the
//! fourth pipe is the encoded frame, passed through verbatim. A legacy form
//! `sender_id : payload` is still accepted on receive (no sequence number,
//! vad assumed 1) but never emitted.
//!
//! ## Control commands (TCP, newline-terminated, one per connection)
//!
//! ```text
//! REGISTER:<id>:<audio_port>[:<secret>]   -> OK | TAKEN | ERR
//! JOIN:<id>:<room>                        -> OK:<multicast_addr> | ERR
//! TARGETS:<id>:<csv>  (alias TALK)        -> OK | ERR
//! PING:<id>                               -> OK | ERR
//! UNREGISTER:<id>                         -> OK
//! LIST                                    -> OK:<csv of sorted ids>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Signed distance from `b` to `a` on the 16-bit sequence circle.
///
/// Positive means `a` is after `b`; the result is in [-32768, 32767].
pub fn seq_distance(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// Sequence `a` strictly after `b` (wrap-aware)
pub fn seq_after(a: u16, b: u16) -> bool {
    seq_distance(a, b) > 0
}

/// Audio packet for network transmission
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    /// Logical sender identity
    pub sender_id: String,

    /// Wrap-around sequence number; None for legacy packets
    pub seq: Option<u16>,

    /// Sample counter, +320 per frame, wraps
    pub timestamp: u32,

    /// Voice-activity flag (metadata only, silence is still carried)
    pub vad: bool,

    /// Opaque encoded frame
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn new(sender_id: &str, seq: u16, timestamp: u32, vad: bool, payload: Bytes) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            seq: Some(seq),
            timestamp,
            vad,
            payload,
        }
    }

    /// Serialize to the current pipe-delimited form.
    ///
    /// Legacy packets are never emitted, so a missing sequence number
    /// serializes as 0.
    pub fn serialize(&self) -> Bytes {
        let header = format!(
            "{}|{}|{}|{}|",
            self.sender_id,
            self.seq.unwrap_or(0),
            self.timestamp,
            self.vad as u8
        );
        let mut buf = BytesMut::with_capacity(header.len() + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram, accepting both the current and the legacy form.
    ///
    /// Header fields are ASCII so the first four pipes always belong to the
    /// header even when the payload contains pipe bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if let Some(packet) = Self::parse_piped(data) {
            return Some(packet);
        }
        Self::parse_legacy(data)
    }

    fn parse_piped(data: &[u8]) -> Option<Self> {
        let mut fields: [&[u8]; 4] = [&[]; 4];
        let mut start = 0usize;
        let mut found = 0usize;
        for (i, &b) in data.iter().enumerate() {
            if b == b'|' {
                fields[found] = &data[start..i];
                start = i + 1;
                found += 1;
                if found == 4 {
                    break;
                }
            }
        }
        if found < 4 {
            return None;
        }

        let sender_id = std::str::from_utf8(fields[0]).ok()?.trim();
        if sender_id.is_empty() {
            return None;
        }
        let seq: u16 = std::str::from_utf8(fields[1]).ok()?.parse().ok()?;
        let timestamp: u32 = std::str::from_utf8(fields[2]).ok()?.parse().ok()?;
        let vad = match fields[3] {
            b"0" => false,
            b"1" => true,
            _ => return None,
        };

        Some(Self {
            sender_id: sender_id.to_string(),
            seq: Some(seq),
            timestamp,
            vad,
            payload: Bytes::copy_from_slice(&data[start..]),
        })
    }

    fn parse_legacy(data: &[u8]) -> Option<Self> {
        let colon = data.iter().position(|&b| b == b':')?;
        let sender_id = std::str::from_utf8(&data[..colon]).ok()?.trim();
        if sender_id.is_empty() {
            return None;
        }
        Some(Self {
            sender_id: sender_id.to_string(),
            seq: None,
            timestamp: 0,
            vad: true,
            payload: Bytes::copy_from_slice(&data[colon + 1..]),
        })
    }

    /// Extract only the sender identity, without copying the payload.
    ///
    /// This is the hub's routing fast path: the first pipe- or
    /// colon-delimited field, whichever delimiter comes first.
    pub fn sender_id_of(data: &[u8]) -> Option<&str> {
        let end = data.iter().position(|&b| b == b'|' || b == b':')?;
        let id = std::str::from_utf8(&data[..end]).ok()?.trim();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// Voice-activity flag straight from the raw datagram.
    ///
    /// Used by the hub when configured to drop silence; legacy packets
    /// report voiced.
    pub fn vad_of(data: &[u8]) -> bool {
        let mut pipes = 0usize;
        let mut field_start = 0usize;
        for (i, &b) in data.iter().enumerate() {
            if b == b'|' {
                if pipes == 3 {
                    return &data[field_start..i] != b"0";
                }
                pipes += 1;
                field_start = i + 1;
            } else if b == b':' && pipes == 0 {
                return true;
            }
        }
        true
    }
}

/// Control-plane commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register {
        id: String,
        audio_port: u16,
        secret: Option<String>,
    },
    Join {
        id: String,
        room: String,
    },
    Targets {
        id: String,
        targets: Vec<String>,
    },
    Ping {
        id: String,
    },
    Unregister {
        id: String,
    },
    List,
}

impl Command {
    /// Parse a single trimmed command line. Returns None for anything that
    /// should be answered with `ERR`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line == "LIST" {
            return Some(Self::List);
        }

        let (verb, rest) = line.split_once(':')?;
        match verb {
            "REGISTER" => {
                let mut parts = rest.splitn(3, ':');
                let id = non_empty(parts.next()?)?;
                let audio_port: u16 = parts.next()?.trim().parse().ok()?;
                let secret = parts.next().map(|s| s.trim().to_string());
                Some(Self::Register {
                    id,
                    audio_port,
                    secret,
                })
            }
            "JOIN" => {
                let (id, room) = rest.split_once(':')?;
                Some(Self::Join {
                    id: non_empty(id)?,
                    room: non_empty(room)?,
                })
            }
            "TARGETS" | "TALK" => {
                let (id, csv) = rest.split_once(':')?;
                let targets = csv
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                Some(Self::Targets {
                    id: non_empty(id)?,
                    targets,
                })
            }
            "PING" => Some(Self::Ping {
                id: non_empty(rest)?,
            }),
            "UNREGISTER" => Some(Self::Unregister {
                id: non_empty(rest)?,
            }),
            _ => None,
        }
    }

    /// Encode for transmission, newline-terminated.
    pub fn encode(&self) -> String {
        match self {
            Self::Register {
                id,
                audio_port,
                secret: Some(secret),
            } => format!("REGISTER:{id}:{audio_port}:{secret}\n"),
            Self::Register {
                id,
                audio_port,
                secret: None,
            } => format!("REGISTER:{id}:{audio_port}\n"),
            Self::Join { id, room } => format!("JOIN:{id}:{room}\n"),
            Self::Targets { id, targets } => format!("TARGETS:{id}:{}\n", targets.join(",")),
            Self::Ping { id } => format!("PING:{id}\n"),
            Self::Unregister { id } => format!("UNREGISTER:{id}\n"),
            Self::List => "LIST\n".to_string(),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Control-plane replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    OkPayload(String),
    Taken,
    Err,
}

impl Reply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "OK" {
            Self::Ok
        } else if let Some(payload) = line.strip_prefix("OK:") {
            Self::OkPayload(payload.to_string())
        } else if line == "TAKEN" {
            Self::Taken
        } else {
            Self::Err
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ok => "OK\n".to_string(),
            Self::OkPayload(p) => format!("OK:{p}\n"),
            Self::Taken => "TAKEN\n".to_string(),
            Self::Err => "ERR\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = AudioPacket::new("3", 12345, 987_654, true, Bytes::from_static(&[1, 2, 3]));
        let wire = packet.serialize();
        let parsed = AudioPacket::parse(&wire).unwrap();

        assert_eq!(parsed.sender_id, "3");
        assert_eq!(parsed.seq, Some(12345));
        assert_eq!(parsed.timestamp, 987_654);
        assert!(parsed.vad);
        assert_eq!(parsed.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_payload_may_contain_delimiters() {
        let payload = Bytes::from_static(b"ab|cd:ef|");
        let wire = AudioPacket::new("7", 1, 320, false, payload.clone()).serialize();
        let parsed = AudioPacket::parse(&wire).unwrap();
        assert_eq!(parsed.payload, payload);
        assert!(!parsed.vad);
    }

    #[test]
    fn test_legacy_form_accepted() {
        let parsed = AudioPacket::parse(b"2:opusdata").unwrap();
        assert_eq!(parsed.sender_id, "2");
        assert_eq!(parsed.seq, None);
        assert!(parsed.vad);
        assert_eq!(parsed.payload.as_ref(), b"opusdata");
    }

    #[test]
    fn test_malformed_packets_rejected() {
        assert!(AudioPacket::parse(b"").is_none());
        assert!(AudioPacket::parse(b"no delimiters at all").is_none());
        assert!(AudioPacket::parse(b"|1|2|1|x").is_none());
        assert!(AudioPacket::parse(b"id|notanumber|2|1|x").is_none());
        assert!(AudioPacket::parse(b"id|1|2|7|x").is_none());
    }

    #[test]
    fn test_sender_id_of() {
        assert_eq!(AudioPacket::sender_id_of(b"4|9|320|1|xx"), Some("4"));
        assert_eq!(AudioPacket::sender_id_of(b"4:xx"), Some("4"));
        assert_eq!(AudioPacket::sender_id_of(b"no-delims"), None);
        assert_eq!(AudioPacket::sender_id_of(b"|stuff"), None);
    }

    #[test]
    fn test_vad_of() {
        assert!(!AudioPacket::vad_of(b"4|9|320|0|xx"));
        assert!(AudioPacket::vad_of(b"4|9|320|1|xx"));
        assert!(AudioPacket::vad_of(b"4:xx"));
    }

    #[test]
    fn test_seq_distance() {
        assert_eq!(seq_distance(5, 3), 2);
        assert_eq!(seq_distance(3, 5), -2);
        assert_eq!(seq_distance(2, 65534), 4);
        assert_eq!(seq_distance(65534, 2), -4);
        assert!(seq_after(0, 65535));
        assert!(!seq_after(65535, 0));
    }

    #[test]
    fn test_command_grammar() {
        assert_eq!(
            Command::parse("REGISTER:1:40123"),
            Some(Command::Register {
                id: "1".into(),
                audio_port: 40123,
                secret: None
            })
        );
        assert_eq!(
            Command::parse("REGISTER:1:40123:hunter2"),
            Some(Command::Register {
                id: "1".into(),
                audio_port: 40123,
                secret: Some("hunter2".into())
            })
        );
        assert_eq!(
            Command::parse("JOIN:1:main"),
            Some(Command::Join {
                id: "1".into(),
                room: "main".into()
            })
        );
        assert_eq!(
            Command::parse("TALK:1:2,3"),
            Some(Command::Targets {
                id: "1".into(),
                targets: vec!["2".into(), "3".into()]
            })
        );
        assert_eq!(
            Command::parse("TARGETS:1:"),
            Some(Command::Targets {
                id: "1".into(),
                targets: vec![]
            })
        );
        assert_eq!(Command::parse("LIST"), Some(Command::List));
        assert_eq!(
            Command::parse("PING:4"),
            Some(Command::Ping { id: "4".into() })
        );
        assert_eq!(Command::parse("REGISTER:1"), None);
        assert_eq!(Command::parse("BOGUS:1:2"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_reply_roundtrip() {
        for reply in [
            Reply::Ok,
            Reply::OkPayload("239.0.0.7".into()),
            Reply::Taken,
            Reply::Err,
        ] {
            assert_eq!(Reply::parse(reply.encode().trim()), reply);
        }
        assert_eq!(Reply::parse("garbage"), Reply::Err);
    }

    proptest! {
        #[test]
        fn seq_distance_antisymmetric(a: u16, b: u16) {
            let d = seq_distance(a, b);
            if d != -32768 {
                prop_assert_eq!(seq_distance(b, a), -d);
            }
        }

        #[test]
        fn seq_distance_successor(a: u16) {
            prop_assert_eq!(seq_distance(a.wrapping_add(1), a), 1);
            prop_assert!(seq_after(a.wrapping_add(1), a));
        }
    }
}

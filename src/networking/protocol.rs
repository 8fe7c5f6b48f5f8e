//! Wire protocol for the Captain/Stoker link.
//!
//! Every frame is one type-tag byte followed by a fixed-layout, little-endian payload.
//! Frames are fire-and-forget; only heartbeats are answered.

use bitflags::bitflags;

/// Tag byte for pedal frames.
pub const TAG_PEDAL: u8 = 0x01;
/// Tag byte for state snapshot frames.
pub const TAG_STATE: u8 = 0x02;
/// Tag byte for game event frames.
pub const TAG_EVENT: u8 = 0x03;
/// Tag byte for heartbeat frames.
pub const TAG_HEARTBEAT: u8 = 0x04;
/// Tag byte for lean frames.
pub const TAG_LEAN: u8 = 0x05;

/// Encoded size of a pedal frame.
pub const PEDAL_LEN: usize = 2;
/// Encoded size of a state frame (tag + 9 floats + flags).
pub const STATE_LEN: usize = 1 + STATE_FLOATS * 4 + 1;
/// Encoded size of an event frame.
pub const EVENT_LEN: usize = 2;
/// Encoded size of a heartbeat frame.
pub const HEARTBEAT_LEN: usize = 2;
/// Encoded size of a lean frame.
pub const LEAN_LEN: usize = 5;

const STATE_FLOATS: usize = 9;

bitflags! {
    /// Discrete rider state carried in the last byte of a state frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateFlags: u8 {
        const FALLEN = 0b0000_0001;
        const BRAKING = 0b0000_0010;
    }
}

/// Which pedal stroke a rider input refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Foot {
    Up,
    Down,
}

impl Foot {
    fn to_byte(self) -> u8 {
        match self {
            Foot::Up => 0x00,
            Foot::Down => 0x01,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Foot::Up),
            0x01 => Some(Foot::Down),
            _ => None,
        }
    }
}

/// Game flow events announced from one rider to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameEvent {
    Countdown,
    Start,
    Crash,
    Reset,
    GameOver,
    Checkpoint,
    Finish,
}

impl GameEvent {
    /// Wire subtype byte.
    pub fn code(self) -> u8 {
        match self {
            GameEvent::Countdown => 1,
            GameEvent::Start => 2,
            GameEvent::Crash => 3,
            GameEvent::Reset => 4,
            GameEvent::GameOver => 5,
            GameEvent::Checkpoint => 6,
            GameEvent::Finish => 7,
        }
    }

    /// Parse a wire subtype byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(GameEvent::Countdown),
            2 => Some(GameEvent::Start),
            3 => Some(GameEvent::Crash),
            4 => Some(GameEvent::Reset),
            5 => Some(GameEvent::GameOver),
            6 => Some(GameEvent::Checkpoint),
            7 => Some(GameEvent::Finish),
            _ => None,
        }
    }
}

/// One full authoritative physics sample of the shared bike.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateSnapshot {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Heading in radians
    pub heading: f32,
    /// Lean angle in radians
    pub lean: f32,
    pub lean_velocity: f32,
    /// Forward speed in m/s
    pub speed: f32,
    /// Crank angle in radians
    pub crank_angle: f32,
    /// Distance along the road in meters
    pub distance_traveled: f32,
    pub flags: StateFlags,
}

impl StateSnapshot {
    /// Continuous fields in wire order.
    pub fn fields(&self) -> [f32; STATE_FLOATS] {
        [
            self.x,
            self.y,
            self.z,
            self.heading,
            self.lean,
            self.lean_velocity,
            self.speed,
            self.crank_angle,
            self.distance_traveled,
        ]
    }

    /// Rebuild a snapshot from continuous fields in wire order.
    pub fn from_fields(fields: [f32; STATE_FLOATS], flags: StateFlags) -> Self {
        let [x, y, z, heading, lean, lean_velocity, speed, crank_angle, distance_traveled] = fields;
        Self {
            x,
            y,
            z,
            heading,
            lean,
            lean_velocity,
            speed,
            crank_angle,
            distance_traveled,
            flags,
        }
    }

    pub fn is_fallen(&self) -> bool {
        self.flags.contains(StateFlags::FALLEN)
    }

    pub fn is_braking(&self) -> bool {
        self.flags.contains(StateFlags::BRAKING)
    }
}

/// Message kinds, used in decode errors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Pedal,
    State,
    Event,
    Heartbeat,
    Lean,
}

impl MessageKind {
    /// Kind for a tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_PEDAL => Some(MessageKind::Pedal),
            TAG_STATE => Some(MessageKind::State),
            TAG_EVENT => Some(MessageKind::Event),
            TAG_HEARTBEAT => Some(MessageKind::Heartbeat),
            TAG_LEAN => Some(MessageKind::Lean),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Pedal => TAG_PEDAL,
            MessageKind::State => TAG_STATE,
            MessageKind::Event => TAG_EVENT,
            MessageKind::Heartbeat => TAG_HEARTBEAT,
            MessageKind::Lean => TAG_LEAN,
        }
    }

    /// Minimum frame length for this kind, tag byte included.
    pub fn encoded_len(self) -> usize {
        match self {
            MessageKind::Pedal => PEDAL_LEN,
            MessageKind::State => STATE_LEN,
            MessageKind::Event => EVENT_LEN,
            MessageKind::Heartbeat => HEARTBEAT_LEN,
            MessageKind::Lean => LEAN_LEN,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Pedal => write!(f, "pedal"),
            MessageKind::State => write!(f, "state"),
            MessageKind::Event => write!(f, "event"),
            MessageKind::Heartbeat => write!(f, "heartbeat"),
            MessageKind::Lean => write!(f, "lean"),
        }
    }
}

/// Game frame exchanged between Captain and Stoker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    Pedal { foot: Foot },
    State(StateSnapshot),
    Event(GameEvent),
    Heartbeat { is_reply: bool },
    Lean(f32),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Pedal { .. } => MessageKind::Pedal,
            Message::State(_) => MessageKind::State,
            Message::Event(_) => MessageKind::Event,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::Lean(_) => MessageKind::Lean,
        }
    }

    /// Encode into a freshly allocated frame.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        let mut buf = Vec::with_capacity(kind.encoded_len());
        buf.push(kind.tag());

        match self {
            Message::Pedal { foot } => buf.push(foot.to_byte()),
            Message::State(snapshot) => {
                for value in snapshot.fields() {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                buf.push(snapshot.flags.bits());
            }
            Message::Event(event) => buf.push(event.code()),
            Message::Heartbeat { is_reply } => buf.push(u8::from(*is_reply)),
            Message::Lean(value) => buf.extend_from_slice(&value.to_le_bytes()),
        }

        buf
    }

    /// Decode a frame. Bytes past the kind's fixed length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, _) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;

        if bytes.len() < kind.encoded_len() {
            return Err(DecodeError::Truncated {
                kind,
                expected: kind.encoded_len(),
                actual: bytes.len(),
            });
        }

        match kind {
            MessageKind::Pedal => {
                let foot = Foot::from_byte(bytes[1]).ok_or(DecodeError::InvalidValue {
                    kind,
                    value: bytes[1],
                })?;
                Ok(Message::Pedal { foot })
            }
            MessageKind::State => {
                let mut fields = [0.0f32; STATE_FLOATS];
                for (i, field) in fields.iter_mut().enumerate() {
                    *field = read_f32(bytes, 1 + i * 4);
                }
                let flags = StateFlags::from_bits_retain(bytes[STATE_LEN - 1]);
                Ok(Message::State(StateSnapshot::from_fields(fields, flags)))
            }
            MessageKind::Event => {
                let event = GameEvent::from_code(bytes[1]).ok_or(DecodeError::InvalidValue {
                    kind,
                    value: bytes[1],
                })?;
                Ok(Message::Event(event))
            }
            MessageKind::Heartbeat => match bytes[1] {
                0x00 => Ok(Message::Heartbeat { is_reply: false }),
                0x01 => Ok(Message::Heartbeat { is_reply: true }),
                value => Err(DecodeError::InvalidValue { kind, value }),
            },
            MessageKind::Lean => Ok(Message::Lean(read_f32(bytes, 1))),
        }
    }
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    f32::from_le_bytes(raw)
}

/// Frame decoding errors. Callers drop the frame; the link stays up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Truncated {kind} frame: expected {expected} bytes, got {actual}")]
    Truncated {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {kind} payload byte 0x{value:02x}")]
    InvalidValue { kind: MessageKind, value: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> StateSnapshot {
        StateSnapshot {
            x: 12.5,
            y: -0.25,
            z: 340.0,
            heading: 1.57,
            lean: -0.12,
            lean_velocity: 0.4,
            speed: 8.3,
            crank_angle: 3.9,
            distance_traveled: 1250.75,
            flags: StateFlags::BRAKING,
        }
    }

    #[test]
    fn test_encoded_lengths() {
        assert_eq!(Message::Pedal { foot: Foot::Down }.encode().len(), 2);
        assert_eq!(Message::State(sample_snapshot()).encode().len(), 38);
        assert_eq!(Message::Event(GameEvent::Crash).encode().len(), 2);
        assert_eq!(Message::Heartbeat { is_reply: true }.encode().len(), 2);
        assert_eq!(Message::Lean(0.5).encode().len(), 5);
    }

    #[test]
    fn test_state_layout_is_little_endian() {
        let bytes = Message::State(sample_snapshot()).encode();

        assert_eq!(bytes[0], TAG_STATE);
        assert_eq!(&bytes[1..5], &12.5f32.to_le_bytes());
        assert_eq!(&bytes[33..37], &1250.75f32.to_le_bytes());
        assert_eq!(bytes[37], 0b10);
    }

    #[test]
    fn test_pedal_and_heartbeat_bytes() {
        assert_eq!(Message::Pedal { foot: Foot::Up }.encode(), vec![0x01, 0x00]);
        assert_eq!(Message::Pedal { foot: Foot::Down }.encode(), vec![0x01, 0x01]);
        assert_eq!(Message::Heartbeat { is_reply: false }.encode(), vec![0x04, 0x00]);
        assert_eq!(Message::Heartbeat { is_reply: true }.encode(), vec![0x04, 0x01]);
        assert_eq!(Message::Event(GameEvent::Finish).encode(), vec![0x03, 7]);
    }

    #[test]
    fn test_round_trip_boundary_values() {
        let extremes = [f32::MIN, f32::MAX, f32::MIN_POSITIVE, -0.0, 0.0, f32::EPSILON];

        for value in extremes {
            let snapshot = StateSnapshot::from_fields(
                [value; STATE_FLOATS],
                StateFlags::FALLEN | StateFlags::BRAKING,
            );
            let msg = Message::State(snapshot);
            assert_eq!(Message::decode(&msg.encode()), Ok(msg));

            let lean = Message::Lean(value);
            let decoded = Message::decode(&lean.encode()).unwrap();
            match decoded {
                Message::Lean(v) => assert_eq!(v.to_bits(), value.to_bits()),
                other => panic!("Wrong message type: {:?}", other),
            }
        }

        let plain = Message::State(StateSnapshot::default());
        assert_eq!(Message::decode(&plain.encode()), Ok(plain));
    }

    #[test]
    fn test_round_trip_every_event() {
        for code in 1..=7 {
            let event = GameEvent::from_code(code).unwrap();
            let msg = Message::Event(event);
            assert_eq!(Message::decode(&msg.encode()), Ok(msg));
        }
    }

    #[test]
    fn test_unknown_flag_bits_survive() {
        let mut bytes = Message::State(sample_snapshot()).encode();
        bytes[37] = 0b1000_0011;

        match Message::decode(&bytes).unwrap() {
            Message::State(s) => {
                assert!(s.is_fallen());
                assert!(s.is_braking());
                assert_eq!(s.flags.bits(), 0b1000_0011);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frames_are_rejected() {
        let full = Message::State(sample_snapshot()).encode();
        for len in 1..full.len() {
            let err = Message::decode(&full[..len]).unwrap_err();
            assert_eq!(
                err,
                DecodeError::Truncated {
                    kind: MessageKind::State,
                    expected: 38,
                    actual: len,
                }
            );
        }

        assert!(matches!(
            Message::decode(&[TAG_LEAN, 0, 0]),
            Err(DecodeError::Truncated { kind: MessageKind::Lean, .. })
        ));
        assert!(matches!(
            Message::decode(&[TAG_PEDAL]),
            Err(DecodeError::Truncated { kind: MessageKind::Pedal, .. })
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Message::decode(&[0x7f, 1, 2]), Err(DecodeError::UnknownTag(0x7f)));
        assert!(matches!(
            Message::decode(&[TAG_EVENT, 0]),
            Err(DecodeError::InvalidValue { kind: MessageKind::Event, value: 0 })
        ));
        assert!(matches!(
            Message::decode(&[TAG_HEARTBEAT, 2]),
            Err(DecodeError::InvalidValue { kind: MessageKind::Heartbeat, value: 2 })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let decoded = Message::decode(&[TAG_PEDAL, 0x01, 0xff, 0xff]).unwrap();
        assert_eq!(decoded, Message::Pedal { foot: Foot::Down });
    }
}

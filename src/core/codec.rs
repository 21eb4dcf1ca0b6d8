//! Apple Media Service frame codec
//! This module maps raw entity-update notification bytes to typed attribute
//! updates, and remote commands to their single-byte wire form.

use std::fmt;
use std::str::{FromStr, Utf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Offset of the first value byte in a compact frame.
const COMPACT_VALUE_OFFSET: usize = 2;

/// Offset of the flags byte in a flagged frame. The value follows it.
const FLAGS_OFFSET: usize = 2;

/// Bit set in the flags byte when the peripheral truncated the value.
const FLAG_TRUNCATED: u8 = 0x01;

/// Smallest frame accepted in either layout: category, attribute, one more byte.
const MIN_FRAME_LEN: usize = 3;

/// Fixed keep-alive frame written to the entity-attribute characteristic.
pub const HEARTBEAT_FRAME: [u8; 2] = [0x00, 0x01];

/// Entity category carried in byte 0 of every update frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeCategory {
    Player = 0x00,
    Queue = 0x01,
    Track = 0x02,
}

impl AttributeCategory {
    pub const ALL: [AttributeCategory; 3] = [Self::Player, Self::Queue, Self::Track];

    /// Wire identifier of the category.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Every attribute defined for this category, in id order.
    pub fn attributes(self) -> Vec<Attribute> {
        match self {
            Self::Player => PlayerAttribute::ALL.iter().copied().map(Attribute::Player).collect(),
            Self::Queue => QueueAttribute::ALL.iter().copied().map(Attribute::Queue).collect(),
            Self::Track => TrackAttribute::ALL.iter().copied().map(Attribute::Track).collect(),
        }
    }
}

impl TryFrom<u8> for AttributeCategory {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Player),
            0x01 => Ok(Self::Queue),
            0x02 => Ok(Self::Track),
            other => Err(DecodeError::UnknownCategory(other)),
        }
    }
}

impl fmt::Display for AttributeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Player => "player",
            Self::Queue => "queue",
            Self::Track => "track",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PlayerAttribute {
    Name = 0x00,
    PlaybackInfo = 0x01,
    Volume = 0x02,
}

impl PlayerAttribute {
    pub const ALL: [PlayerAttribute; 3] = [Self::Name, Self::PlaybackInfo, Self::Volume];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueueAttribute {
    Index = 0x00,
    Count = 0x01,
    ShuffleMode = 0x02,
    RepeatMode = 0x03,
}

impl QueueAttribute {
    pub const ALL: [QueueAttribute; 4] =
        [Self::Index, Self::Count, Self::ShuffleMode, Self::RepeatMode];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrackAttribute {
    Artist = 0x00,
    Album = 0x01,
    Title = 0x02,
    Duration = 0x03,
}

impl TrackAttribute {
    pub const ALL: [TrackAttribute; 4] = [Self::Artist, Self::Album, Self::Title, Self::Duration];
}

/// A (category, sub-attribute) pair. Only valid combinations are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Player(PlayerAttribute),
    Queue(QueueAttribute),
    Track(TrackAttribute),
}

impl Attribute {
    /// Resolves a sub-attribute id within a category.
    pub fn from_ids(category: AttributeCategory, id: u8) -> Result<Self, DecodeError> {
        let attribute = match (category, id) {
            (AttributeCategory::Player, 0x00) => Self::Player(PlayerAttribute::Name),
            (AttributeCategory::Player, 0x01) => Self::Player(PlayerAttribute::PlaybackInfo),
            (AttributeCategory::Player, 0x02) => Self::Player(PlayerAttribute::Volume),
            (AttributeCategory::Queue, 0x00) => Self::Queue(QueueAttribute::Index),
            (AttributeCategory::Queue, 0x01) => Self::Queue(QueueAttribute::Count),
            (AttributeCategory::Queue, 0x02) => Self::Queue(QueueAttribute::ShuffleMode),
            (AttributeCategory::Queue, 0x03) => Self::Queue(QueueAttribute::RepeatMode),
            (AttributeCategory::Track, 0x00) => Self::Track(TrackAttribute::Artist),
            (AttributeCategory::Track, 0x01) => Self::Track(TrackAttribute::Album),
            (AttributeCategory::Track, 0x02) => Self::Track(TrackAttribute::Title),
            (AttributeCategory::Track, 0x03) => Self::Track(TrackAttribute::Duration),
            (category, id) => return Err(DecodeError::UnknownAttribute { category, id }),
        };
        Ok(attribute)
    }

    pub fn category(self) -> AttributeCategory {
        match self {
            Self::Player(_) => AttributeCategory::Player,
            Self::Queue(_) => AttributeCategory::Queue,
            Self::Track(_) => AttributeCategory::Track,
        }
    }

    /// Wire identifier of the sub-attribute within its category.
    pub fn id(self) -> u8 {
        match self {
            Self::Player(attr) => attr as u8,
            Self::Queue(attr) => attr as u8,
            Self::Track(attr) => attr as u8,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Player(attr) => write!(f, "player.{:?}", attr),
            Self::Queue(attr) => write!(f, "queue.{:?}", attr),
            Self::Track(attr) => write!(f, "track.{:?}", attr),
        }
    }
}

/// Frame layout variants seen on the entity-update characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameLayout {
    /// `[category, attribute, value...]`
    #[default]
    Compact,
    /// `[category, attribute, flags, value...]`
    Flagged,
}

/// One decoded entity update. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeUpdate {
    attribute: Attribute,
    value: String,
    truncated: bool,
}

impl AttributeUpdate {
    pub fn new(attribute: Attribute, value: impl Into<String>) -> Self {
        Self {
            attribute,
            value: value.into(),
            truncated: false,
        }
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn category(&self) -> AttributeCategory {
        self.attribute.category()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// True when a flagged frame marked the value as truncated by the peripheral.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Reasons a notification frame is dropped. None of these are fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("unknown attribute category {0:#04x}")]
    UnknownCategory(u8),
    #[error("unknown attribute {id:#04x} in {category} category")]
    UnknownAttribute { category: AttributeCategory, id: u8 },
    #[error("attribute value is not valid UTF-8: {0}")]
    InvalidPayload(#[source] Utf8Error),
}

/// Decodes a compact entity-update frame: value bytes start at offset 2.
pub fn decode(bytes: &[u8]) -> Result<AttributeUpdate, DecodeError> {
    decode_frame(bytes, FrameLayout::Compact)
}

/// Decodes an entity-update frame in the given layout.
pub fn decode_frame(bytes: &[u8], layout: FrameLayout) -> Result<AttributeUpdate, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort { len: bytes.len() });
    }

    let category = AttributeCategory::try_from(bytes[0])?;
    let attribute = Attribute::from_ids(category, bytes[1])?;

    let (truncated, value_bytes) = match layout {
        FrameLayout::Compact => (false, &bytes[COMPACT_VALUE_OFFSET..]),
        FrameLayout::Flagged => (
            bytes[FLAGS_OFFSET] & FLAG_TRUNCATED != 0,
            &bytes[FLAGS_OFFSET + 1..],
        ),
    };
    let value = std::str::from_utf8(value_bytes).map_err(DecodeError::InvalidPayload)?;

    Ok(AttributeUpdate {
        attribute,
        value: value.to_owned(),
        truncated,
    })
}

/// Builds the write that asks the peripheral to push every attribute of `category`.
pub fn encode_subscription(category: AttributeCategory) -> Vec<u8> {
    let mut frame = vec![category.id()];
    frame.extend(category.attributes().into_iter().map(Attribute::id));
    frame
}

/// Remote commands understood by the media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlCommand {
    Play = 0x00,
    Pause = 0x01,
    TogglePlayPause = 0x02,
    NextTrack = 0x03,
    PreviousTrack = 0x04,
    VolumeUp = 0x05,
    VolumeDown = 0x06,
    RepeatMode = 0x07,
    ShuffleMode = 0x08,
    SkipForward = 0x09,
    SkipBackward = 0x0A,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 11] = [
        Self::Play,
        Self::Pause,
        Self::TogglePlayPause,
        Self::NextTrack,
        Self::PreviousTrack,
        Self::VolumeUp,
        Self::VolumeDown,
        Self::RepeatMode,
        Self::ShuffleMode,
        Self::SkipForward,
        Self::SkipBackward,
    ];

    /// Convert the command to its byte representation
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    fn name(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::TogglePlayPause => "toggle",
            Self::NextTrack => "next",
            Self::PreviousTrack => "previous",
            Self::VolumeUp => "volume-up",
            Self::VolumeDown => "volume-down",
            Self::RepeatMode => "repeat",
            Self::ShuffleMode => "shuffle",
            Self::SkipForward => "skip-forward",
            Self::SkipBackward => "skip-backward",
        }
    }
}

/// Encodes a command into its single wire byte.
pub fn encode(command: ControlCommand) -> u8 {
    command.to_byte()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCommand {
    #[error("no remote command with id {0:#04x}")]
    Id(u8),
    #[error("no remote command named {0:?}")]
    Name(String),
}

impl TryFrom<u8> for ControlCommand {
    type Error = InvalidCommand;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(InvalidCommand::Id(value))
    }
}

impl FromStr for ControlCommand {
    type Err = InvalidCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|command| command.name() == wanted)
            .ok_or_else(|| InvalidCommand::Name(s.to_owned()))
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_track_frames_for_every_attribute() {
        for id in 0..=3u8 {
            let frame = [0x02, id, b'a', b'b', b'c'];
            let update = decode(&frame).unwrap();
            assert_eq!(update.category(), AttributeCategory::Track);
            assert_eq!(update.attribute().id(), id);
            assert_eq!(update.value(), "abc");
            assert!(!update.is_truncated());
        }
    }

    #[test]
    fn decoding_is_deterministic() {
        let frame = [0x00, 0x02, b'5', b'0'];
        assert_eq!(decode(&frame), decode(&frame));
    }

    #[test]
    fn rejects_short_frames() {
        assert_eq!(decode(&[0x00, 0x00]), Err(DecodeError::TooShort { len: 2 }));
        assert_eq!(decode(&[]), Err(DecodeError::TooShort { len: 0 }));
    }

    #[test]
    fn rejects_unknown_category() {
        assert_eq!(
            decode(&[0x05, 0x00, 0x41]),
            Err(DecodeError::UnknownCategory(0x05))
        );
    }

    #[test]
    fn rejects_unknown_attribute() {
        assert_eq!(
            decode(&[0x00, 0x03, 0x41]),
            Err(DecodeError::UnknownAttribute {
                category: AttributeCategory::Player,
                id: 0x03,
            })
        );
        assert!(matches!(
            decode(&[0x01, 0x04, 0x41]),
            Err(DecodeError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(matches!(
            decode(&[0x02, 0x02, 0xFF, 0xFE]),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn multibyte_values_survive() {
        let mut frame = vec![0x02, 0x00];
        frame.extend("Sigur Rós".as_bytes());
        assert_eq!(decode(&frame).unwrap().value(), "Sigur Rós");
    }

    #[test]
    fn flagged_layout_skips_flags_byte() {
        let update = decode_frame(&[0x02, 0x02, 0x01, b'H', b'i'], FrameLayout::Flagged).unwrap();
        assert_eq!(update.attribute(), Attribute::Track(TrackAttribute::Title));
        assert_eq!(update.value(), "Hi");
        assert!(update.is_truncated());

        let update = decode_frame(&[0x01, 0x01, 0x00], FrameLayout::Flagged).unwrap();
        assert_eq!(update.value(), "");
        assert!(!update.is_truncated());
    }

    #[test]
    fn command_bytes_are_ordinals() {
        assert_eq!(encode(ControlCommand::Play), 0x00);
        assert_eq!(encode(ControlCommand::NextTrack), 0x03);
        assert_eq!(encode(ControlCommand::SkipBackward), 0x0A);
        for command in ControlCommand::ALL {
            assert_eq!(ControlCommand::try_from(encode(command)), Ok(command));
        }
        assert_eq!(ControlCommand::try_from(0x0B), Err(InvalidCommand::Id(0x0B)));
    }

    #[test]
    fn commands_parse_from_names() {
        assert_eq!("next".parse(), Ok(ControlCommand::NextTrack));
        assert_eq!(" Volume-Up ".parse(), Ok(ControlCommand::VolumeUp));
        assert!("louder".parse::<ControlCommand>().is_err());
        for command in ControlCommand::ALL {
            assert_eq!(command.to_string().parse(), Ok(command));
        }
    }

    #[test]
    fn subscription_frames_list_every_attribute() {
        assert_eq!(
            encode_subscription(AttributeCategory::Track),
            vec![0x02, 0x00, 0x01, 0x02, 0x03]
        );
        assert_eq!(
            encode_subscription(AttributeCategory::Queue),
            vec![0x01, 0x00, 0x01, 0x02, 0x03]
        );
        assert_eq!(
            encode_subscription(AttributeCategory::Player),
            vec![0x00, 0x00, 0x01, 0x02]
        );
    }
}

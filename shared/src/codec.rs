//! Text codec for the vehicle SDK
//!
//! Every message is one UDP datagram carrying a newline-less ASCII string:
//! ```text
//! -> "command" | "takeoff" | "forward 50" | "battery?" | "EXT led 255 0 0" ...
//! <- "ok" | "87" | "120cm" | "error Not joystick"
//! ```
//!
//! There is no framing and no request identifier, so a reply can only be
//! correlated with a request by its source address (see [`crate::channel`]).

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The literal success token
pub const OK_TOKEN: &str = "ok";

/// Errors raised while interpreting a reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Reply is not valid UTF-8 ({0} bytes)")]
    InvalidUtf8(usize),

    #[error("Expected a number, got '{0}'")]
    NotNumeric(String),

    #[error("Expected '<int>cm', got '{0}'")]
    NotHeight(String),
}

/// Movement directions understood by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Back => "back",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Command vocabulary consumed by the session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enter SDK mode
    Sdk,
    Takeoff,
    Land,
    /// Query battery percentage
    Battery,
    /// Query height in cm
    Height,
    StreamOn,
    StreamOff,
    /// Move in a direction by the given distance (cm)
    Move(Direction, u32),
    /// Rotate clockwise (degrees)
    Cw(u32),
    /// Rotate counter-clockwise (degrees)
    Ccw(u32),
    /// Forward flip
    Flip,
    /// Top LED colour (vendor extension)
    Led { r: u8, g: u8, b: u8 },
    /// Opaque pass-through string, e.g. `EXT mled ...`
    Raw(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sdk => write!(f, "command"),
            Command::Takeoff => write!(f, "takeoff"),
            Command::Land => write!(f, "land"),
            Command::Battery => write!(f, "battery?"),
            Command::Height => write!(f, "height?"),
            Command::StreamOn => write!(f, "streamon"),
            Command::StreamOff => write!(f, "streamoff"),
            Command::Move(dir, cm) => write!(f, "{} {}", dir.as_str(), cm),
            Command::Cw(deg) => write!(f, "cw {}", deg),
            Command::Ccw(deg) => write!(f, "ccw {}", deg),
            Command::Flip => write!(f, "flip f"),
            Command::Led { r, g, b } => write!(f, "EXT led {} {} {}", r, g, b),
            Command::Raw(text) => write!(f, "{}", text),
        }
    }
}

/// Decode a reply datagram into trimmed text
pub fn decode_reply(datagram: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(datagram)
        .map(|s| s.trim().to_string())
        .map_err(|_| ProtocolError::InvalidUtf8(datagram.len()))
}

/// True iff the reply is exactly the success token
pub fn is_ok(reply: &str) -> bool {
    reply == OK_TOKEN
}

/// Parse a `battery?` reply: a plain integer percentage
pub fn parse_battery(reply: &str) -> Result<u32, ProtocolError> {
    reply
        .trim()
        .parse::<u32>()
        .map_err(|_| ProtocolError::NotNumeric(reply.to_string()))
}

/// Parse a `height?` reply of the form `<int>cm`
pub fn parse_height(reply: &str) -> Result<i32, ProtocolError> {
    reply
        .trim()
        .strip_suffix("cm")
        .and_then(|n| n.parse::<i32>().ok())
        .ok_or_else(|| ProtocolError::NotHeight(reply.to_string()))
}

/// Split a status push (`pitch:0;roll:0;bat:87;h:120;`) into its fields
///
/// Malformed segments without a `:` are skipped.
pub fn parse_state_fields(payload: &str) -> BTreeMap<String, String> {
    payload
        .trim()
        .split(';')
        .filter_map(|segment| {
            let (key, value) = segment.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

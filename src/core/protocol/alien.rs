// src/core/protocol/alien.rs

//! The DTU ("alien" client) registration packet.
//!
//! A DTU dials the server and identifies itself with a fixed 28-byte packet:
//!
//! ```text
//! 0..5    48 73 6E 00 17     signature, last byte = bytes that follow
//! 5..16   device id          11 ASCII bytes, NUL/space padded
//! 16..22  password           6 ASCII bytes
//! 22..28  reserved
//! ```
//!
//! The server answers with `48 73 6E 00 01 <status>`.

use crate::core::errors::{LinkError, LinkResult};
use std::fmt;

pub const LOGIN_PACKET_LENGTH: usize = 28;
pub const STATUS_PACKET_LENGTH: usize = 6;
pub const DEVICE_ID_LENGTH: usize = 11;
pub const PASSWORD_LENGTH: usize = 6;

const SIGNATURE: [u8; 4] = [0x48, 0x73, 0x6E, 0x00];
const LOGIN_REMAINING: u8 = 0x17;
const STATUS_REMAINING: u8 = 0x01;

/// Outcome of a DTU registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoginStatus {
    Success = 0x00,
    DuplicateLogin = 0x01,
    Forbidden = 0x02,
    BadPassword = 0x03,
}

impl LoginStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> LinkResult<Self> {
        match code {
            0x00 => Ok(LoginStatus::Success),
            0x01 => Ok(LoginStatus::DuplicateLogin),
            0x02 => Ok(LoginStatus::Forbidden),
            0x03 => Ok(LoginStatus::BadPassword),
            other => Err(LinkError::Protocol(format!(
                "unknown login status 0x{other:02x}"
            ))),
        }
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LoginStatus::Success => "success",
            LoginStatus::DuplicateLogin => "device is already online",
            LoginStatus::Forbidden => "device is forbidden",
            LoginStatus::BadPassword => "password is wrong",
        };
        f.write_str(text)
    }
}

/// A parsed registration packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlienLoginPacket {
    pub device_id: String,
    pub password: String,
}

impl AlienLoginPacket {
    pub fn new(device_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            password: password.into(),
        }
    }

    pub fn parse(packet: &[u8]) -> LinkResult<Self> {
        if packet.len() < LOGIN_PACKET_LENGTH {
            return Err(LinkError::IncompleteData);
        }
        if packet[..4] != SIGNATURE || packet[4] != LOGIN_REMAINING {
            return Err(LinkError::Protocol(
                "login packet signature mismatch".to_string(),
            ));
        }
        Ok(Self {
            device_id: ascii_field(&packet[5..16]),
            password: ascii_field(&packet[16..22]),
        })
    }

    pub fn encode(&self) -> LinkResult<[u8; LOGIN_PACKET_LENGTH]> {
        if !self.device_id.is_ascii() || self.device_id.len() > DEVICE_ID_LENGTH {
            return Err(LinkError::InvalidArgument(format!(
                "device id must be at most {DEVICE_ID_LENGTH} ASCII characters"
            )));
        }
        if !self.password.is_ascii() || self.password.len() > PASSWORD_LENGTH {
            return Err(LinkError::InvalidArgument(format!(
                "password must be at most {PASSWORD_LENGTH} ASCII characters"
            )));
        }
        let mut packet = [0u8; LOGIN_PACKET_LENGTH];
        packet[..4].copy_from_slice(&SIGNATURE);
        packet[4] = LOGIN_REMAINING;
        packet[5..5 + self.device_id.len()].copy_from_slice(self.device_id.as_bytes());
        packet[16..16 + self.password.len()].copy_from_slice(self.password.as_bytes());
        Ok(packet)
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

pub fn encode_status(status: LoginStatus) -> [u8; STATUS_PACKET_LENGTH] {
    [
        SIGNATURE[0],
        SIGNATURE[1],
        SIGNATURE[2],
        SIGNATURE[3],
        STATUS_REMAINING,
        status.code(),
    ]
}

pub fn decode_status(packet: &[u8]) -> LinkResult<LoginStatus> {
    if packet.len() < STATUS_PACKET_LENGTH {
        return Err(LinkError::IncompleteData);
    }
    if packet[..4] != SIGNATURE || packet[4] != STATUS_REMAINING {
        return Err(LinkError::Protocol(
            "status packet signature mismatch".to_string(),
        ));
    }
    LoginStatus::from_code(packet[5])
}

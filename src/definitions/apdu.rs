//! Short-form command and response units exchanged with a card (ISO 7816-4).
//!
//! A command is rendered as `CLA INS P1 P2 [Lc data] [Le]`, a response as
//! `data SW1 SW2`. Only the short length encoding is supported: the payload
//! is limited to 255 bytes and the expected response length to one byte.
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Status word for normal completion.
pub const SW_SUCCESS: u16 = 0x9000;

const HEADER_LEN: usize = 4;
const MAX_SHORT_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid command or response format: {0}")]
    InvalidFormat(String),
}

macro_rules! invalid_format {
    ($($arg:tt)*) => {
        return Err(Error::InvalidFormat(format!($($arg)*)))
    };
}

/// A command unit as sent to a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Vec<u8>>,
    le: Option<u8>,
}

impl Command {
    /// A header-only command (case 1).
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Attach a payload. An empty payload is treated as absent.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let data = data.into();
        if data.len() > MAX_SHORT_LEN {
            invalid_format!(
                "payload of {} bytes does not fit in a single length byte",
                data.len()
            );
        }
        self.data = (!data.is_empty()).then_some(data);
        Ok(self)
    }

    /// Attach the expected response length, rendered as the trailing byte.
    pub const fn with_expected_length(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub const fn class(&self) -> u8 {
        self.cla
    }

    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    pub const fn p1(&self) -> u8 {
        self.p1
    }

    pub const fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub const fn expected_length(&self) -> Option<u8> {
        self.le
    }

    /// Decode a command from its hex rendering.
    pub fn parse_hex(hex_str: &str) -> Result<Self, Error> {
        if hex_str.len() % 2 != 0 {
            invalid_format!("hex string has odd length {}", hex_str.len());
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidFormat(format!("could not decode hex: {e}")))?;
        Self::parse(&bytes)
    }

    /// Decode a command from raw bytes.
    ///
    /// Four bytes are a bare header. A fifth byte alone is the expected
    /// response length. Beyond five bytes, the fifth byte is the payload
    /// length, followed by the payload and an optional expected length.
    pub fn parse(command_bytes: &[u8]) -> Result<Self, Error> {
        debug!("APDU: {}", hex::encode_upper(command_bytes));
        if command_bytes.len() < HEADER_LEN {
            invalid_format!(
                "command needs at least {HEADER_LEN} bytes, got {}",
                command_bytes.len()
            );
        }

        let mut command = Self::new(
            command_bytes[0],
            command_bytes[1],
            command_bytes[2],
            command_bytes[3],
        );
        let body = &command_bytes[HEADER_LEN..];

        match body {
            [] => {}
            [le] => command.le = Some(*le),
            [lc, rest @ ..] => {
                let payload_len = *lc as usize;
                if rest.len() < payload_len {
                    invalid_format!(
                        "declared payload length {payload_len} exceeds the {} remaining bytes",
                        rest.len()
                    );
                }
                let (payload, trailer) = rest.split_at(payload_len);
                command.le = match trailer {
                    [] => None,
                    [le] => Some(*le),
                    _ => invalid_format!(
                        "{} unexpected bytes after the payload",
                        trailer.len()
                    ),
                };
                // An explicit Lc=00 stays an empty payload and renders back as 00.
                command.data = Some(payload.to_vec());
            }
        }

        Ok(command)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let data_len = self.data.as_ref().map_or(0, |d| d.len() + 1);
        let mut bytes = Vec::with_capacity(HEADER_LEN + data_len + 1);
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if let Some(data) = &self.data {
            bytes.push(data.len() as u8);
            bytes.extend_from_slice(data);
        }
        if let Some(le) = self.le {
            bytes.push(le);
        }
        bytes
    }

    /// Uppercase hex rendering, as used in scenario definitions.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(bytes)
    }
}

impl From<&Command> for Vec<u8> {
    fn from(command: &Command) -> Self {
        command.to_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CLA={:02X} INS={:02X} P1={:02X} P2={:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, " Lc={:02X} DATA={}", data.len(), hex::encode_upper(data))?;
        }
        if let Some(le) = self.le {
            write!(f, " Le={le:02X}")?;
        }
        Ok(())
    }
}

/// Status word (SW1-SW2) terminating a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}

impl StatusWord {
    pub const SUCCESS: Self = Self::from_u16(SW_SUCCESS);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn is_success(self) -> bool {
        self.to_u16() == SW_SUCCESS
    }

    /// Human readable meaning of the status word.
    pub const fn description(self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, 0x00) => "No information given",
            (0x62, 0x81) => "Part of returned data may be corrupted",
            (0x62, 0x82) => "End of file/record reached before reading Le bytes",
            (0x62, 0x83) => "Selected file invalidated",
            (0x62, 0x84) => "FCI not formatted according to ISO 7816-4",
            (0x63, 0x00) => "Verification failed",
            (0x63, 0x81) => "File filled up by the last write",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Verification failed, retries remaining",
            (0x64, 0x00) => "State of non-volatile memory unchanged",
            (0x65, 0x00) => "State of non-volatile memory changed",
            (0x65, 0x81) => "Memory failure",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x81) => "Logical channel not supported",
            (0x68, 0x82) => "Secure messaging not supported",
            (0x69, 0x81) => "Command incompatible with file structure",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x84) => "Referenced data invalidated",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x69, 0x87) => "Expected secure messaging data objects missing",
            (0x69, 0x88) => "Secure messaging data objects incorrect",
            (0x6A, 0x80) => "Incorrect parameters in the data field",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x83) => "Record not found",
            (0x6A, 0x84) => "Not enough memory space in the file",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

impl From<StatusWord> for u16 {
    fn from(value: StatusWord) -> Self {
        value.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.to_u16())
    }
}

/// A response unit as returned by a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Vec<u8>,
    pub status: StatusWord,
}

impl Response {
    pub fn new(payload: impl Into<Vec<u8>>, status: StatusWord) -> Self {
        Self {
            payload: payload.into(),
            status,
        }
    }

    pub fn parse_hex(hex_str: &str) -> Result<Self, Error> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidFormat(format!("could not decode hex: {e}")))?;
        Self::try_from(bytes.as_slice())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(response: &[u8]) -> Result<Self, Self::Error> {
        let Some((payload, status)) = response.split_last_chunk::<2>() else {
            invalid_format!("response needs at least 2 bytes, got {}", response.len());
        };
        Ok(Self {
            payload: payload.to_vec(),
            status: StatusWord::new(status[0], status[1]),
        })
    }
}

impl From<Response> for Vec<u8> {
    fn from(response: Response) -> Self {
        let mut response_bytes = Vec::with_capacity(2 + response.payload.len());
        response_bytes.extend_from_slice(&response.payload);
        response_bytes.extend_from_slice(&response.status.to_bytes());
        response_bytes
    }
}

/// The status word formed by the last two bytes of a response.
pub fn extract_status_word(response: &[u8]) -> Result<u16, Error> {
    match response.split_last_chunk::<2>() {
        Some((_, sw)) => Ok(u16::from_be_bytes(*sw)),
        None => invalid_format!("response needs at least 2 bytes, got {}", response.len()),
    }
}

/// The data part of a response, empty when there is nothing besides the status word.
pub fn extract_data(response: &[u8]) -> &[u8] {
    match response.split_last_chunk::<2>() {
        Some((data, _)) => data,
        None => &[],
    }
}

pub fn is_success(response: &[u8]) -> Result<bool, Error> {
    Ok(extract_status_word(response)? == SW_SUCCESS)
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(commands: Vec<&str>) {
        for command in commands {
            let parsed = Command::parse_hex(command).expect("failed to parse command");
            assert_eq!(command.to_uppercase(), parsed.to_hex());
            assert_eq!(parsed, Command::parse_hex(&parsed.to_hex()).unwrap());
        }
    }

    #[test]
    /// commands as they appear in card scenarios
    fn card_commands() {
        roundtrip(vec![
            "00A4040C",
            "00B0910000",
            "00A4040C07D2760001448000",
            "00A4040002AABB10",
            "00B2010400",
            "0084000008",
            "00a4040007d276000085010100",
        ]);
    }

    #[test]
    fn header_fields() {
        let command = Command::parse_hex("00A4040002AABB10").unwrap();
        assert_eq!(command.class(), 0x00);
        assert_eq!(command.instruction(), 0xA4);
        assert_eq!(command.p1(), 0x04);
        assert_eq!(command.p2(), 0x00);
        assert_eq!(command.data(), Some([0xAA, 0xBB].as_slice()));
        assert_eq!(command.expected_length(), Some(0x10));
    }

    #[test]
    fn five_bytes_is_expected_length() {
        let command = Command::parse_hex("00B0000010").unwrap();
        assert_eq!(command.data(), None);
        assert_eq!(command.expected_length(), Some(0x10));
    }

    #[test]
    fn payload_without_expected_length() {
        let command = Command::parse_hex("00A4040C02E103").unwrap();
        assert_eq!(command.data(), Some([0xE1, 0x03].as_slice()));
        assert_eq!(command.expected_length(), None);
    }

    #[test]
    fn zero_lc_with_expected_length() {
        let command = Command::parse_hex("00A4040C0010").unwrap();
        assert_eq!(command.instruction(), 0xA4);
        assert_eq!(command.p2(), 0x0C);
        assert_eq!(command.data(), Some([].as_slice()));
        assert_eq!(command.expected_length(), Some(0x10));
        assert_eq!(command.to_hex(), "00A4040C0010");
        assert!(Command::parse_hex("00A4040C001011").is_err());
    }

    #[test]
    fn rejects_malformed_hex() {
        for input in ["00A404", "00A4040", "00A4040G", "", "00A4040005AABB", "00A4040002AABB1011"] {
            assert!(
                matches!(Command::parse_hex(input), Err(Error::InvalidFormat(_))),
                "{input} should not parse"
            );
        }
    }

    #[test]
    fn builder_renders_bytes() {
        let command = Command::new(0x00, 0xA4, 0x04, 0x0C)
            .with_data(vec![0xD2, 0x76, 0x00, 0x01, 0x44, 0x80, 0x00])
            .unwrap()
            .with_expected_length(0x00);
        assert_eq!(command.to_hex(), "00A4040C07D276000144800000");
        assert_eq!(
            command.to_string(),
            "CLA=00 INS=A4 P1=04 P2=0C Lc=07 DATA=D2760001448000 Le=00"
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let result = Command::new(0x00, 0xD6, 0x00, 0x00).with_data(vec![0u8; 256]);
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn status_word_extraction() {
        assert_eq!(extract_status_word(&[0x90, 0x00]).unwrap(), 0x9000);
        assert_eq!(extract_status_word(&[0x01, 0x02, 0x6A, 0x82]).unwrap(), 0x6A82);
        assert!(extract_status_word(&[0x90]).is_err());
        assert!(extract_status_word(&[]).is_err());
    }

    #[test]
    fn data_extraction() {
        assert_eq!(extract_data(&[0x01, 0x02, 0x90, 0x00]), &[0x01, 0x02]);
        assert!(extract_data(&[0x90, 0x00]).is_empty());
        assert!(extract_data(&[0x90]).is_empty());
        assert!(is_success(&[0x01, 0x90, 0x00]).unwrap());
        assert!(!is_success(&[0x6A, 0x82]).unwrap());
    }

    #[test]
    fn response_parsing() {
        let response = Response::parse_hex("AABB6A82").unwrap();
        assert_eq!(response.payload, vec![0xAA, 0xBB]);
        assert_eq!(response.status.to_string(), "6A82");
        assert_eq!(response.status.description(), "File not found");
        assert!(!response.is_success());
        assert_eq!(Vec::<u8>::from(response), vec![0xAA, 0xBB, 0x6A, 0x82]);
    }

    #[test]
    fn unknown_status_word() {
        assert_eq!(StatusWord::from_u16(0x1234).description(), "Unknown status word");
        assert_eq!(StatusWord::SUCCESS.description(), "Success");
    }
}

//! ISO 7816-4 command and response framing.
//!
//! Only short APDUs are supported (Lc and Le fit in one byte). That is all
//! a Type 4 tag exchange of at most 255 bytes ever needs.

use std::fmt;

use crate::error::TransportError;

// ---------------------------------------------------------------------------
// StatusWord
// ---------------------------------------------------------------------------

/// Two-byte trailer of every APDU response (SW1 SW2).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// `90 00` — normal processing.
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    /// `67 00` — wrong length.
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    /// `69 86` — command not allowed (no current file or application).
    pub const COMMAND_NOT_ALLOWED: StatusWord = StatusWord(0x6986);
    /// `6A 82` — file or application not found.
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    /// `6B 00` — offset outside the file.
    pub const WRONG_PARAMETERS: StatusWord = StatusWord(0x6B00);
    /// `6D 00` — instruction not supported.
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    /// `6E 00` — class not supported.
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6E00);

    /// Builds a status word from SW1 and SW2.
    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    /// SW1 and SW2.
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Whether this is `90 00`.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// ISO 7816-4 instruction bytes used by the tap exchange.
pub mod ins {
    /// SELECT.
    pub const SELECT: u8 = 0xA4;
    /// READ BINARY.
    pub const READ_BINARY: u8 = 0xB0;
}

/// A parsed short command APDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduCommand {
    /// Class byte.
    pub cla: u8,
    /// Instruction byte.
    pub ins: u8,
    /// First parameter.
    pub p1: u8,
    /// Second parameter.
    pub p2: u8,
    /// Command data field (empty when Lc is absent).
    pub data: Vec<u8>,
    /// Expected response length. `Some(256)` encodes Le = `00`.
    pub le: Option<u16>,
}

impl ApduCommand {
    /// SELECT by DF name (application identifier), first occurrence, FCI
    /// requested.
    pub fn select_application(aid: &[u8]) -> Self {
        Self {
            cla: 0x00,
            ins: ins::SELECT,
            p1: 0x04,
            p2: 0x00,
            data: aid.to_vec(),
            le: Some(256),
        }
    }

    /// SELECT elementary file by identifier, no response data.
    pub fn select_file(file_id: [u8; 2]) -> Self {
        Self {
            cla: 0x00,
            ins: ins::SELECT,
            p1: 0x00,
            p2: 0x0C,
            data: file_id.to_vec(),
            le: None,
        }
    }

    /// READ BINARY at `offset` for `le` bytes (`le` = 0 is not allowed; use
    /// 256 for the maximum).
    pub fn read_binary(offset: u16, le: u16) -> Self {
        let [p1, p2] = offset.to_be_bytes();
        Self {
            cla: 0x00,
            ins: ins::READ_BINARY,
            p1,
            p2,
            data: Vec::new(),
            le: Some(le),
        }
    }

    /// P1P2 read as a big-endian offset.
    pub fn offset(&self) -> u16 {
        u16::from_be_bytes([self.p1, self.p2])
    }

    /// Parses a short APDU (cases 1 to 4).
    ///
    /// Returns `None` for anything shorter than the 4-byte header or with
    /// an Lc that disagrees with the buffer length.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 4 {
            return None;
        }
        let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];

        let (data, le) = match body.len() {
            0 => (Vec::new(), None),
            1 => (Vec::new(), Some(decode_le(body[0]))),
            _ => {
                let lc = body[0] as usize;
                if lc == 0 {
                    return None;
                }
                let rest = &body[1..];
                if rest.len() == lc {
                    (rest.to_vec(), None)
                } else if rest.len() == lc + 1 {
                    (rest[..lc].to_vec(), Some(decode_le(rest[lc])))
                } else {
                    return None;
                }
            }
        };

        Some(Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
        })
    }

    /// Serializes the command to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(if le >= 256 { 0x00 } else { le as u8 });
        }
        out
    }
}

fn decode_le(byte: u8) -> u16 {
    if byte == 0 {
        256
    } else {
        byte as u16
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response APDU split into body and status word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data, status word stripped.
    pub data: Vec<u8>,
    /// Trailing SW1 SW2.
    pub status: StatusWord,
}

impl ApduResponse {
    /// A bare status word with no data.
    pub fn status(status: StatusWord) -> Self {
        Self {
            data: Vec::new(),
            status,
        }
    }

    /// Data followed by `90 00`.
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            data,
            status: StatusWord::SUCCESS,
        }
    }

    /// Splits raw response bytes. Anything shorter than a status word is a
    /// transport failure.
    pub fn parse(mut raw: Vec<u8>) -> Result<Self, TransportError> {
        if raw.len() < 2 {
            return Err(TransportError::TruncatedResponse { len: raw.len() });
        }
        let sw2 = raw.pop().unwrap_or_default();
        let sw1 = raw.pop().unwrap_or_default();
        Ok(Self {
            data: raw,
            status: StatusWord::from_bytes(sw1, sw2),
        })
    }

    /// Serializes to data followed by SW1 SW2.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.status.to_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn builders_match_wire_constants() {
        assert_eq!(
            ApduCommand::select_application(&config::NDEF_APPLICATION_AID).to_bytes(),
            config::SELECT_APPLICATION_COMMAND
        );
        assert_eq!(
            ApduCommand::select_file(config::NDEF_FILE_ID).to_bytes(),
            config::SELECT_FILE_COMMAND
        );
        assert_eq!(
            ApduCommand::read_binary(0, 255).to_bytes(),
            config::READ_BINARY_COMMAND
        );
    }

    #[test]
    fn parses_all_short_cases() {
        let case1 = ApduCommand::parse(&[0x00, 0xA4, 0x00, 0x00]).unwrap();
        assert!(case1.data.is_empty() && case1.le.is_none());

        let case2 = ApduCommand::parse(&config::READ_BINARY_COMMAND).unwrap();
        assert_eq!(case2.ins, ins::READ_BINARY);
        assert_eq!(case2.le, Some(255));

        let case3 = ApduCommand::parse(&config::SELECT_FILE_COMMAND).unwrap();
        assert_eq!(case3.data, config::NDEF_FILE_ID);
        assert_eq!(case3.le, None);

        let case4 = ApduCommand::parse(&config::SELECT_APPLICATION_COMMAND).unwrap();
        assert_eq!(case4.data, config::NDEF_APPLICATION_AID);
        assert_eq!(case4.le, Some(256));
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        assert!(ApduCommand::parse(&[0x00, 0xA4]).is_none());
        assert!(ApduCommand::parse(&[0x00, 0xA4, 0x00, 0x0C, 0x05, 0xE1]).is_none());
    }

    #[test]
    fn response_split() {
        let response = ApduResponse::parse(vec![0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02]);
        assert!(response.status.is_success());
        assert_eq!(response.to_bytes(), vec![0x01, 0x02, 0x90, 0x00]);

        assert_eq!(
            ApduResponse::parse(vec![0x90]),
            Err(TransportError::TruncatedResponse { len: 1 })
        );
    }

    #[test]
    fn status_word_display() {
        assert_eq!(StatusWord::from_bytes(0x6A, 0x82).to_string(), "6A82");
        assert_eq!(StatusWord::SUCCESS.to_bytes(), [0x90, 0x00]);
    }
}

//! NFC Forum Type 4 tag image and its card-side APDU handling.
//!
//! The emulated card exposes one application (the NDEF Tag Application)
//! with two files:
//!
//! | File  | Contents                                         |
//! |-------|--------------------------------------------------|
//! | E103  | Capability Container: version, limits, NDEF TLV  |
//! | E104  | NDEF file: NLEN + text record with the request   |
//!
//! Both are read-only. [`TagImage::respond`] is a pure function of the image
//! and the per-link [`LinkState`]; the session layer owns the state and
//! decides what a completed read means.

use crate::apdu::command::{ins, ApduCommand, ApduResponse, StatusWord};
use crate::config;
use crate::request::EncodedPayload;

/// Capability Container length.
const CC_LEN: u16 = 0x000F;

/// Mapping version 2.0.
const MAPPING_VERSION: u8 = 0x20;

/// NDEF File Control TLV tag and length.
const NDEF_FILE_CONTROL_TLV: [u8; 2] = [0x04, 0x06];

/// Read access granted without security.
const READ_ACCESS_GRANTED: u8 = 0x00;

/// Write access denied.
const WRITE_ACCESS_DENIED: u8 = 0xFF;

/// File currently selected on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectedFile {
    /// Nothing selected yet.
    #[default]
    None,
    /// E103.
    CapabilityContainer,
    /// E104.
    Ndef,
}

/// Selection state of one reader connection. Reset whenever the reader
/// leaves the field or a new payload is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    /// Whether the NDEF application has been selected.
    pub application_selected: bool,
    /// Currently selected file.
    pub file: SelectedFile,
}

/// Result of handling one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagResponse {
    /// Response APDU to send back.
    pub response: ApduResponse,
    /// True when this command delivered the last byte of the NDEF file.
    pub payload_read: bool,
}

impl TagResponse {
    fn status(status: StatusWord) -> Self {
        Self {
            response: ApduResponse::status(status),
            payload_read: false,
        }
    }
}

/// The two files served by the emulated card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagImage {
    capability_container: Vec<u8>,
    ndef_file: EncodedPayload,
}

impl TagImage {
    /// Wraps an encoded payload as the NDEF file of a read-only tag.
    pub fn new(ndef_file: EncodedPayload) -> Self {
        Self {
            capability_container: capability_container(config::MAX_FILE_SIZE as u16),
            ndef_file,
        }
    }

    /// Contents of E103.
    pub fn capability_container(&self) -> &[u8] {
        &self.capability_container
    }

    /// Contents of E104.
    pub fn ndef_file(&self) -> &EncodedPayload {
        &self.ndef_file
    }

    /// Handles one raw command APDU.
    pub fn respond(&self, link: &mut LinkState, raw: &[u8]) -> TagResponse {
        let Some(command) = ApduCommand::parse(raw) else {
            return TagResponse::status(StatusWord::WRONG_LENGTH);
        };
        if command.cla != 0x00 {
            return TagResponse::status(StatusWord::CLA_NOT_SUPPORTED);
        }

        match command.ins {
            ins::SELECT => TagResponse::status(self.select(link, &command)),
            ins::READ_BINARY => self.read_binary(link, &command),
            _ => TagResponse::status(StatusWord::INS_NOT_SUPPORTED),
        }
    }

    fn select(&self, link: &mut LinkState, command: &ApduCommand) -> StatusWord {
        match command.p1 {
            // Select by DF name.
            0x04 => {
                link.file = SelectedFile::None;
                link.application_selected = command.data == config::NDEF_APPLICATION_AID;
                if link.application_selected {
                    StatusWord::SUCCESS
                } else {
                    StatusWord::FILE_NOT_FOUND
                }
            }
            // Select EF by identifier.
            0x00 => {
                if !link.application_selected {
                    return StatusWord::COMMAND_NOT_ALLOWED;
                }
                if command.data.len() != 2 {
                    return StatusWord::WRONG_LENGTH;
                }
                let file_id = [command.data[0], command.data[1]];
                link.file = if file_id == config::CC_FILE_ID {
                    SelectedFile::CapabilityContainer
                } else if file_id == config::NDEF_FILE_ID {
                    SelectedFile::Ndef
                } else {
                    SelectedFile::None
                };
                if link.file == SelectedFile::None {
                    StatusWord::FILE_NOT_FOUND
                } else {
                    StatusWord::SUCCESS
                }
            }
            _ => StatusWord::WRONG_PARAMETERS,
        }
    }

    fn read_binary(&self, link: &LinkState, command: &ApduCommand) -> TagResponse {
        let file: &[u8] = match link.file {
            SelectedFile::None => return TagResponse::status(StatusWord::COMMAND_NOT_ALLOWED),
            SelectedFile::CapabilityContainer => &self.capability_container,
            SelectedFile::Ndef => self.ndef_file.as_bytes(),
        };

        let offset = command.offset() as usize;
        if offset >= file.len() {
            return TagResponse::status(StatusWord::WRONG_PARAMETERS);
        }
        let le = command.le.unwrap_or(256) as usize;
        let end = file.len().min(offset + le);

        TagResponse {
            response: ApduResponse::success(file[offset..end].to_vec()),
            payload_read: link.file == SelectedFile::Ndef && end == file.len(),
        }
    }
}

/// Builds a read-only Capability Container for an NDEF file of at most
/// `max_ndef_size` bytes.
pub fn capability_container(max_ndef_size: u16) -> Vec<u8> {
    let max_read = (config::MAX_FILE_SIZE as u16).to_be_bytes();
    let mut cc = Vec::with_capacity(CC_LEN as usize);
    cc.extend_from_slice(&CC_LEN.to_be_bytes());
    cc.push(MAPPING_VERSION);
    cc.extend_from_slice(&max_read); // MLe
    cc.extend_from_slice(&max_read); // MLc
    cc.extend_from_slice(&NDEF_FILE_CONTROL_TLV);
    cc.extend_from_slice(&config::NDEF_FILE_ID);
    cc.extend_from_slice(&max_ndef_size.to_be_bytes());
    cc.push(READ_ACCESS_GRANTED);
    cc.push(WRITE_ACCESS_DENIED);
    cc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{encode, PaymentRequest, Token};
    use rust_decimal::Decimal;

    fn image() -> TagImage {
        let request = PaymentRequest::new(Token::SOL, Decimal::new(15, 1), "Addr1").unwrap();
        TagImage::new(encode(&request).unwrap())
    }

    fn select_app(image: &TagImage, link: &mut LinkState) {
        let out = image.respond(link, &config::SELECT_APPLICATION_COMMAND);
        assert!(out.response.status.is_success());
    }

    #[test]
    fn capability_container_layout() {
        let cc = capability_container(255);
        assert_eq!(cc.len(), 15);
        assert_eq!(
            cc,
            vec![0x00, 0x0F, 0x20, 0x00, 0xFF, 0x00, 0xFF, 0x04, 0x06, 0xE1, 0x04, 0x00, 0xFF, 0x00, 0xFF]
        );
    }

    #[test]
    fn wrong_aid_is_not_found() {
        let image = image();
        let mut link = LinkState::default();
        let out = image.respond(
            &mut link,
            &ApduCommand::select_application(&[0xA0, 0x00, 0x00, 0x00, 0x03]).to_bytes(),
        );
        assert_eq!(out.response.status, StatusWord::FILE_NOT_FOUND);
        assert!(!link.application_selected);
    }

    #[test]
    fn file_select_requires_application() {
        let image = image();
        let mut link = LinkState::default();
        let out = image.respond(&mut link, &config::SELECT_FILE_COMMAND);
        assert_eq!(out.response.status, StatusWord::COMMAND_NOT_ALLOWED);
    }

    #[test]
    fn full_read_flags_payload() {
        let image = image();
        let mut link = LinkState::default();
        select_app(&image, &mut link);
        assert!(image
            .respond(&mut link, &config::SELECT_FILE_COMMAND)
            .response
            .status
            .is_success());

        let out = image.respond(&mut link, &config::READ_BINARY_COMMAND);
        assert!(out.payload_read);
        assert_eq!(out.response.data, image.ndef_file().as_bytes());
    }

    #[test]
    fn chunked_read_flags_only_last_chunk() {
        let image = image();
        let mut link = LinkState::default();
        select_app(&image, &mut link);
        image.respond(&mut link, &config::SELECT_FILE_COMMAND);

        let head = image.respond(&mut link, &ApduCommand::read_binary(0, 2).to_bytes());
        assert!(!head.payload_read);
        let nlen = u16::from_be_bytes([head.response.data[0], head.response.data[1]]);

        let body = image.respond(&mut link, &ApduCommand::read_binary(2, nlen).to_bytes());
        assert!(body.payload_read);
        assert_eq!(body.response.data.len(), nlen as usize);
    }

    #[test]
    fn reading_cc_never_flags_payload() {
        let image = image();
        let mut link = LinkState::default();
        select_app(&image, &mut link);
        image.respond(
            &mut link,
            &ApduCommand::select_file(config::CC_FILE_ID).to_bytes(),
        );
        let out = image.respond(&mut link, &ApduCommand::read_binary(0, 15).to_bytes());
        assert!(!out.payload_read);
        assert_eq!(out.response.data, image.capability_container());
    }

    #[test]
    fn error_statuses() {
        let image = image();
        let mut link = LinkState::default();
        assert_eq!(
            image.respond(&mut link, &[0x00]).response.status,
            StatusWord::WRONG_LENGTH
        );
        assert_eq!(
            image.respond(&mut link, &[0x80, 0xA4, 0x04, 0x00]).response.status,
            StatusWord::CLA_NOT_SUPPORTED
        );
        assert_eq!(
            image.respond(&mut link, &[0x00, 0xD6, 0x00, 0x00]).response.status,
            StatusWord::INS_NOT_SUPPORTED
        );
        assert_eq!(
            image.respond(&mut link, &config::READ_BINARY_COMMAND).response.status,
            StatusWord::COMMAND_NOT_ALLOWED
        );

        select_app(&image, &mut link);
        image.respond(&mut link, &config::SELECT_FILE_COMMAND);
        assert_eq!(
            image
                .respond(&mut link, &ApduCommand::read_binary(0x0400, 1).to_bytes())
                .response
                .status,
            StatusWord::WRONG_PARAMETERS
        );
    }
}

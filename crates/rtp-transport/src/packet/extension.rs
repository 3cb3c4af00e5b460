//! RTP header extensions (RFC 8285)
//!
//! Supports reading and rewriting both the one-byte (`0xBEDE`) and the
//! two-byte (`0x100X`) element forms. Rewrites rebuild the whole extension
//! block, choosing the one-byte form whenever every element fits in it.

use super::{RawPacket, RTP_FIXED_HEADER_SIZE};
use crate::error::Error;
use crate::Result;

/// Profile marker of the one-byte form
pub const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// Profile marker of the two-byte form (low 4 bits are app bits)
pub const TWO_BYTE_PROFILE: u16 = 0x1000;

/// Highest id usable in the one-byte form
pub const ONE_BYTE_MAX_ID: u8 = 14;

/// Largest element the one-byte form can carry
pub const ONE_BYTE_MAX_LEN: usize = 16;

/// One header extension element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    /// Local identifier negotiated for the extension
    pub id: u8,
    /// Element payload
    pub data: Vec<u8>,
}

impl HeaderExtension {
    pub fn new(id: u8, data: impl Into<Vec<u8>>) -> Self {
        Self { id, data: data.into() }
    }

    fn fits_one_byte(&self) -> bool {
        (1..=ONE_BYTE_MAX_ID).contains(&self.id) && (1..=ONE_BYTE_MAX_LEN).contains(&self.data.len())
    }
}

/// Parse the elements of an extension block body
fn parse_elements(profile: u16, body: &[u8]) -> Vec<HeaderExtension> {
    let mut elements = Vec::new();
    let mut i = 0;

    if profile == ONE_BYTE_PROFILE {
        while i < body.len() {
            let b = body[i];
            let id = b >> 4;
            if id == 0 {
                // padding
                i += 1;
                continue;
            }
            if id == 15 {
                break;
            }
            let len = (b & 0x0F) as usize + 1;
            if i + 1 + len > body.len() {
                break;
            }
            elements.push(HeaderExtension::new(id, &body[i + 1..i + 1 + len]));
            i += 1 + len;
        }
    } else if profile & 0xFFF0 == TWO_BYTE_PROFILE {
        while i < body.len() {
            let id = body[i];
            if id == 0 {
                i += 1;
                continue;
            }
            if i + 1 >= body.len() {
                break;
            }
            let len = body[i + 1] as usize;
            if i + 2 + len > body.len() {
                break;
            }
            elements.push(HeaderExtension::new(id, &body[i + 2..i + 2 + len]));
            i += 2 + len;
        }
    }

    elements
}

/// Serialize elements into a complete extension block (preamble included)
fn build_block(elements: &[HeaderExtension]) -> Vec<u8> {
    let one_byte = elements.iter().all(HeaderExtension::fits_one_byte);
    let mut body = Vec::new();

    for ext in elements {
        if one_byte {
            body.push((ext.id << 4) | (ext.data.len() as u8 - 1));
        } else {
            body.push(ext.id);
            body.push(ext.data.len() as u8);
        }
        body.extend_from_slice(&ext.data);
    }
    while body.len() % 4 != 0 {
        body.push(0);
    }

    let profile = if one_byte { ONE_BYTE_PROFILE } else { TWO_BYTE_PROFILE };
    let mut block = Vec::with_capacity(4 + body.len());
    block.extend_from_slice(&profile.to_be_bytes());
    block.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
    block.extend_from_slice(&body);
    block
}

impl RawPacket {
    fn extension_block_start(&self) -> usize {
        RTP_FIXED_HEADER_SIZE + self.csrc_count() * 4
    }

    /// Profile of the extension block, if any
    pub fn extension_profile(&self) -> Option<u16> {
        if self.extension_block_length() == 0 {
            return None;
        }
        let at = self.extension_block_start();
        let d = self.data();
        Some(u16::from_be_bytes([d[at], d[at + 1]]))
    }

    /// All RFC 8285 elements of the packet
    pub fn header_extensions(&self) -> Vec<HeaderExtension> {
        let block_len = self.extension_block_length();
        if block_len == 0 {
            return Vec::new();
        }
        let at = self.extension_block_start();
        let d = self.data();
        let profile = u16::from_be_bytes([d[at], d[at + 1]]);
        parse_elements(profile, &d[at + 4..at + block_len])
    }

    /// Payload of the element with the given id
    pub fn header_extension(&self, id: u8) -> Option<Vec<u8>> {
        self.header_extensions()
            .into_iter()
            .find(|ext| ext.id == id)
            .map(|ext| ext.data)
    }

    /// Add or replace the element with the given id
    pub fn set_header_extension(&mut self, id: u8, data: &[u8]) -> Result<()> {
        if id == 0 || data.is_empty() || data.len() > 255 {
            return Err(Error::InvalidPacket(format!(
                "Invalid header extension id={} len={}",
                id,
                data.len()
            )));
        }
        if self.is_invalid_rtp() {
            return Err(Error::InvalidPacket("Not an RTP packet".to_string()));
        }
        if self.extension_profile().is_some_and(|p| p != ONE_BYTE_PROFILE && p & 0xFFF0 != TWO_BYTE_PROFILE) {
            return Err(Error::InvalidPacket("Packet carries a non RFC 8285 extension".to_string()));
        }

        let mut elements = self.header_extensions();
        match elements.iter_mut().find(|ext| ext.id == id) {
            Some(ext) => ext.data = data.to_vec(),
            None => elements.push(HeaderExtension::new(id, data)),
        }
        self.replace_extension_block(&elements);
        Ok(())
    }

    /// Remove the element with the given id. Returns whether it was present.
    pub fn remove_header_extension(&mut self, id: u8) -> bool {
        let mut elements = self.header_extensions();
        let before = elements.len();
        elements.retain(|ext| ext.id != id);
        if elements.len() == before {
            return false;
        }
        self.replace_extension_block(&elements);
        true
    }

    fn replace_extension_block(&mut self, elements: &[HeaderExtension]) {
        let at = self.extension_block_start();
        let old_len = self.extension_block_length();
        if old_len > 0 {
            self.remove_bytes(at, old_len);
        }
        if elements.is_empty() {
            self.data_mut()[0] &= !0x10;
            return;
        }
        let block = build_block(elements);
        self.insert_bytes(at, &block);
        self.data_mut()[0] |= 0x10;
    }
}

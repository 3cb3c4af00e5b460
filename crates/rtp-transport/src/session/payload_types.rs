use std::collections::{BTreeMap, HashMap};

use crate::device::MediaFormat;
use crate::error::Error;
use crate::Result;

/// Payload type to format mapping negotiated for a session
#[derive(Debug, Clone, Default)]
pub struct DynamicPayloadTypeTable {
    formats: BTreeMap<u8, MediaFormat>,
    overrides: HashMap<u8, u8>,
}

impl DynamicPayloadTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `payload_type` with `format`, returning the previous format
    pub fn insert(&mut self, payload_type: u8, format: MediaFormat) -> Result<Option<MediaFormat>> {
        check_payload_type(payload_type)?;
        Ok(self.formats.insert(payload_type, format))
    }

    pub fn remove(&mut self, payload_type: u8) -> Option<MediaFormat> {
        self.formats.remove(&payload_type)
    }

    pub fn get(&self, payload_type: u8) -> Option<&MediaFormat> {
        self.formats.get(&payload_type)
    }

    /// Lowest payload type whose format matches `predicate`
    pub fn find(&self, predicate: impl Fn(&MediaFormat) -> bool) -> Option<u8> {
        self.formats
            .iter()
            .find(|(_, format)| predicate(format))
            .map(|(pt, _)| *pt)
    }

    pub fn telephone_event(&self) -> Option<u8> {
        self.find(MediaFormat::is_telephone_event)
    }

    pub fn red(&self) -> Option<u8> {
        self.find(MediaFormat::is_red)
    }

    pub fn ulpfec(&self) -> Option<u8> {
        self.find(MediaFormat::is_ulpfec)
    }

    pub fn flexfec(&self) -> Option<u8> {
        self.find(MediaFormat::is_flexfec)
    }

    /// Rewrite `original` to `replacement` on outgoing packets
    pub fn add_override(&mut self, original: u8, replacement: u8) -> Result<()> {
        check_payload_type(original)?;
        check_payload_type(replacement)?;
        self.overrides.insert(original, replacement);
        Ok(())
    }

    pub fn overrides(&self) -> &HashMap<u8, u8> {
        &self.overrides
    }

    /// Forget every association and override
    pub fn clear(&mut self) {
        self.formats.clear();
        self.overrides.clear();
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &MediaFormat)> {
        self.formats.iter().map(|(pt, format)| (*pt, format))
    }
}

fn check_payload_type(payload_type: u8) -> Result<()> {
    if payload_type > 127 {
        return Err(Error::ConfigError(format!(
            "Invalid payload type: {} (must be 0-127)",
            payload_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_format() {
        let mut table = DynamicPayloadTypeTable::new();
        table.insert(111, MediaFormat::audio("opus", 48000)).unwrap();
        table.insert(126, MediaFormat::telephone_event(48000)).unwrap();
        table.insert(101, MediaFormat::telephone_event(8000)).unwrap();
        table.insert(63, MediaFormat::audio("red", 48000)).unwrap();

        assert_eq!(table.telephone_event(), Some(101));
        assert_eq!(table.red(), Some(63));
        assert_eq!(table.ulpfec(), None);
        assert!(table.insert(128, MediaFormat::audio("opus", 48000)).is_err());

        table.add_override(111, 96).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table.overrides().is_empty());
    }
}

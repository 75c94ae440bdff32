//! Multipart upload part keys
//!
//! Parts of an in-progress upload are stored as ordinary objects in the
//! target bucket under `.multipart/<upload-id>/<part-number>`.

use crate::error::{Error, Result};
use std::fmt;
use uuid::Uuid;

const PART_PREFIX: &str = ".multipart";

/// Identity of one uploaded part: `(upload_id, part_number)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartKey {
    pub upload_id: Uuid,
    pub part_number: u32,
}

impl PartKey {
    #[must_use]
    pub const fn new(upload_id: Uuid, part_number: u32) -> Self {
        Self {
            upload_id,
            part_number,
        }
    }

    /// Build a part key from a textual upload ID
    pub fn from_parts(upload_id: &str, part_number: u32) -> Result<Self> {
        let upload_id = Uuid::parse_str(upload_id)
            .map_err(|e| Error::invalid_input(format!("malformed upload id '{upload_id}': {e}")))?;
        Ok(Self::new(upload_id, part_number))
    }

    /// Parse an object key previously produced by [`PartKey::object_key`]
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || Error::invalid_input(format!("not a multipart part key: '{key}'"));

        let rest = key
            .strip_prefix(PART_PREFIX)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(malformed)?;
        let (upload_id, number) = rest.split_once('/').ok_or_else(malformed)?;
        let part_number = number.parse::<u32>().map_err(|_| malformed())?;

        Self::from_parts(upload_id, part_number)
    }

    /// Object key under which this part is stored
    #[must_use]
    pub fn object_key(&self) -> String {
        format!("{PART_PREFIX}/{}/{:05}", self.upload_id, self.part_number)
    }
}

impl fmt::Display for PartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_key())
    }
}

/// Order parts by ascending part number and return their object keys.
///
/// Duplicate part numbers are rejected; they would make assembly ambiguous.
pub fn ordered_part_keys(mut parts: Vec<PartKey>) -> Result<Vec<String>> {
    parts.sort_unstable();
    if let Some(w) = parts.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::invalid_input(format!(
            "duplicate part number {}",
            w[0].part_number
        )));
    }
    Ok(parts.iter().map(PartKey::object_key).collect())
}

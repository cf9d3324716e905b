use crate::{ItemId, ItemsError, Result};

const ID_BYTES: usize = 8;

/// Encodes ids as a flat array of 8-byte big-endian values.
pub fn encode_ids(ids: &[ItemId]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ids.len() * ID_BYTES);
    for id in ids {
        bytes.extend_from_slice(&id.0.to_be_bytes());
    }
    bytes
}

pub fn decode_ids(bytes: &[u8]) -> Result<Vec<ItemId>> {
    if bytes.len() % ID_BYTES != 0 {
        return Err(ItemsError::BadIdList(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(ID_BYTES)
        .map(|chunk| {
            let mut raw = [0u8; ID_BYTES];
            raw.copy_from_slice(chunk);
            ItemId(i64::from_be_bytes(raw))
        })
        .collect())
}

/// Appends ids not yet present, keeping insertion order.
pub fn insert_ids(bytes: &[u8], ids: &[ItemId]) -> Result<Vec<u8>> {
    let mut current = decode_ids(bytes)?;
    for id in ids {
        if !current.contains(id) {
            current.push(*id);
        }
    }
    Ok(encode_ids(&current))
}

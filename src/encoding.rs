use bincode::Options;

use crate::DbResult;

/// Options shared by every internal envelope. Big-endian fixed-width integers
/// keep encoded sequence ids ordered the same way as the numbers themselves.
fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub(crate) fn encode<S: ?Sized + serde::Serialize>(item: &S) -> DbResult<Vec<u8>> {
    Ok(options().serialize(item)?)
}

pub(crate) fn decode<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> DbResult<T> {
    Ok(options().deserialize(bytes)?)
}

/// Tree key for a row sequence id.
pub(crate) fn id_key(id: u64) -> sled::IVec {
    sled::IVec::from(&id.to_be_bytes()[..])
}

pub(crate) fn id_from_key(bytes: &[u8]) -> DbResult<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        crate::StoreError::Corrupted(format!("row key has {} bytes", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_keys_sort_numerically() {
        let mut keys = vec![id_key(300), id_key(2), id_key(1 << 40), id_key(17)];
        keys.sort();

        let ids: Vec<u64> = keys.iter().map(|k| id_from_key(k).unwrap()).collect();
        assert_eq!(ids, vec![2, 17, 300, 1 << 40]);
    }

    #[test]
    fn id_key_matches_envelope_encoding() {
        assert_eq!(encode(&42u64).unwrap(), id_key(42).to_vec());
    }

    #[test]
    fn short_row_key_is_corruption() {
        assert!(matches!(
            id_from_key(&[1, 2, 3]),
            Err(crate::StoreError::Corrupted(_))
        ));
    }
}

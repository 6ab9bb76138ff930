use log::info;

use crate::{config::KEY_DEVICE_ID, error::StoreError, store::KvStore};

pub const DEVICE_ID_PREFIX: &str = "HG-";

/// `HG-` followed by the upper-case hex of the factory MAC.
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    let bits = mac
        .iter()
        .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte));
    format!("{DEVICE_ID_PREFIX}{bits:X}")
}

/// Returns the persisted id, generating and storing one on first boot.
pub fn ensure_device_id<S: KvStore>(store: &mut S, mac: [u8; 6]) -> Result<String, StoreError> {
    if let Some(id) = store
        .get_str(KEY_DEVICE_ID)?
        .filter(|id| !id.trim().is_empty())
    {
        return Ok(id);
    }

    let id = device_id_from_mac(mac);
    info!("generated device id {id}");
    store.set_str(KEY_DEVICE_ID, &id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn is_valid_device_id(id: &str) -> bool {
        id.strip_prefix(DEVICE_ID_PREFIX).is_some_and(|hex| {
            !hex.is_empty() && hex.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
    }

    #[test]
    fn generated_ids_match_the_expected_pattern() {
        for mac in [
            [0, 0, 0, 0, 0, 0],
            [0xff; 6],
            [0x24, 0x6f, 0x28, 0x1a, 0x2b, 0x3c],
            [0x00, 0x00, 0x00, 0x00, 0x0a, 0xbc],
        ] {
            let id = device_id_from_mac(mac);
            assert!(is_valid_device_id(&id), "{id}");
        }
        assert_eq!(device_id_from_mac([0, 0, 0, 0, 0x0a, 0xbc]), "HG-ABC");
    }

    #[test]
    fn id_is_stable_across_boots() {
        let mut store = MemoryStore::new();
        let first = ensure_device_id(&mut store, [1, 2, 3, 4, 5, 6]).unwrap();
        // A different MAC on a later boot must not change the persisted id.
        let second = ensure_device_id(&mut store, [9, 9, 9, 9, 9, 9]).unwrap();

        assert_eq!(first, "HG-10203040506");
        assert_eq!(first, second);
    }
}

//! Key material never outlives its last handle.

use std::sync::Arc;

use bastion::crypto::{Algorithm, KeyService, SecureRandom};
use bastion::types::{Clock, ManualClock};

fn service() -> KeyService {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_000));
    let random = Arc::new(SecureRandom::new(clock.clone(), None).expect("should seed"));
    KeyService::new(random, 8, clock)
}

#[test]
fn deleted_key_slot_is_zeroed() {
    let keys = service();
    let key = keys.generate_key(Algorithm::Aes, 256).expect("generate");
    let slot = key.slot();
    let material = key.with_material(<[u8]>::to_vec).expect("material");
    assert!(material.iter().any(|&b| b != 0));

    keys.store(key, "doomed").expect("store");
    keys.delete("doomed").expect("delete");

    let dump = keys.arena().dump(slot).expect("dump");
    assert!(dump.iter().all(|&b| b == 0), "freed slot still holds bytes");
    assert!(!dump.windows(material.len()).any(|w| w == material.as_slice()));
    assert_eq!(keys.stats().keys_destroyed, 1);
}

#[test]
fn outstanding_handle_keeps_material_until_dropped() {
    let keys = service();
    let key = keys.generate_key(Algorithm::ChaCha20, 256).expect("generate");
    let slot = key.slot();
    keys.store(Arc::clone(&key), "shared").expect("store");
    keys.delete("shared").expect("delete");

    assert!(keys.arena().dump(slot).expect("dump").iter().any(|&b| b != 0));
    drop(key);
    assert!(keys.arena().dump(slot).expect("dump").iter().all(|&b| b == 0));
}

#[test]
fn debug_never_prints_material() {
    let keys = service();
    let key = keys.generate_key(Algorithm::Hmac, 256).expect("generate");
    let hex: String = key
        .with_material(|m| m.iter().map(|b| format!("{b:02x}")).collect())
        .expect("material");
    assert!(!format!("{key:?}").contains(&hex));
}

// Fixed vectors produced by an independent implementation of the same
// on-disk format. Uncompressed frames are fully deterministic (per-path IV,
// no encoder freedom), so those are compared byte for byte in both
// directions. Deflate encoders may legally differ stream-for-stream, so the
// compressed vector is checked on the decrypt path only.

use block_codec::{Codec, Compressor};
use stratus_core::keys::{derive_pass_key, DataKey};

const DATA_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

const CONFIG_PLAIN: &[u8] = br#"{"bs":65536,"crypt_key":"00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff","requires":["compress-deflate"],"size":1048576}"#;

const CONFIG_CIPHER_HEX: &str = "3e4bd32bff824a13dd9bae904306e6f26e64c3a755b3c9e782db56a6f0ffcc4500c43bd01db094e9e8bca4ce6ee2b7b367008056a13435b67e5e76171fd03b2ff93d6418542d75c624c6376cf026fd76ac7e1e2088bfa26d1471cc38dd71866fbf29e3f36d500ea0da462116abfc1d1c39edab4e62f7ab2aa1dcc6bb867682afc739117dc1eeedc1efe483a00510507b2f354fd3b8683b763a3b4aad9899c98a2185f6ebbc8829fa3bee261686c90c28212ea8a5fef0319c4da6e1fa43a4101052b5cc1a05c5e6ab4f17de078c9437a55e941cc7cdfb496947f75815a468f82d";

// 512 bytes of a repeating ASCII phrase; deflate shrinks it, so the stored
// frame carries flag = 1 and is much shorter than the payload.
const BLOCK7_CIPHER_HEX: &str = "11b3c8d1ff092f02485f536796e13390f873f3cecd379087fee66708452e5e09d26f505525f7decbc2897f455818bb7f7b0161bda75774d0b11f019296bfef7859c894b3f4bfbce12f8a4b634aede7963ead0fd6524188ca4a4c67ca8c04e6c7";

// A 48-byte ramp inflates under deflate, so it is stored raw (flag = 0).
const BLOCK8_CIPHER_HEX: &str = "38c5fba1d9487dd483e930b57c483b2e92be8f771119320326484ca709a1d60a348dbd8a568e95e37288bc92ff0e412871ebc207c85354f9f310b9af042ba0435c793fbe058237daf6f3d7ba21b3c8ec0c18e2b5b73c5647579391f1f3a00930225a4ab7e0e0f7dd10f6eb456038e4be95da2d6a40b6a4ec95d0c119a99357ae";

fn interop_codec() -> Codec {
    let data_key = DataKey::from_hex(DATA_KEY_HEX).unwrap();
    Codec::new(derive_pass_key("opensesame"), Some(data_key), Compressor::Deflate)
}

fn block7_payload() -> Vec<u8> {
    b"stratocumulus ".repeat(37)[..512].to_vec()
}

#[test]
fn pass_key_derivation_matches() {
    let key = derive_pass_key("opensesame");
    assert_eq!(
        hex::encode(key.as_bytes()),
        "0b535329925d50338aff3e800509d23c6a3707f29600c5ab05c318a8c4848f72"
    );
}

#[test]
fn iv_derivation_matches() {
    assert_eq!(hex::encode(block_codec::derive_iv("config")), "1ae55f9586363034dc4857b2695785ee");
    assert_eq!(
        hex::encode(block_codec::derive_iv("blocks/7")),
        "7d9506932b01903c0e653eae815b407f"
    );
}

#[test]
fn decrypts_foreign_config_object() {
    let c = interop_codec();
    let ct = hex::decode(CONFIG_CIPHER_HEX).unwrap();
    assert_eq!(c.decrypt("config", &ct).unwrap(), CONFIG_PLAIN);
}

#[test]
fn encrypts_config_object_identically() {
    let c = interop_codec();
    let ct = c.encrypt("config", CONFIG_PLAIN).unwrap();
    assert_eq!(hex::encode(ct), CONFIG_CIPHER_HEX);
}

#[test]
fn decrypts_foreign_compressed_block() {
    let c = interop_codec();
    let payload = block7_payload();
    let foreign = hex::decode(BLOCK7_CIPHER_HEX).unwrap();
    assert_eq!(c.decrypt("blocks/7", &foreign).unwrap(), payload);
    // Our own encryption of the same payload must also compress (the frame
    // stays far below the 512-byte payload) and round-trip.
    let ours = c.encrypt("blocks/7", &payload).unwrap();
    assert!(ours.len() < payload.len());
    assert_eq!(c.decrypt("blocks/7", &ours).unwrap(), payload);
}

#[test]
fn raw_block_matches_both_ways() {
    let c = interop_codec();
    let payload: Vec<u8> = (0u8..48).collect();
    let expected = hex::decode(BLOCK8_CIPHER_HEX).unwrap();
    assert_eq!(c.encrypt("blocks/8", &payload).unwrap(), expected);
    assert_eq!(c.decrypt("blocks/8", &expected).unwrap(), payload);
}

//! Property-based tests for strata-core using proptest
//!
//! These tests verify invariants that should hold for all valid inputs.

use proptest::prelude::*;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use strata_core::{
    container_digest, digest_bytes, digest_reader, extract, seal, ContainerLayer, Digest,
};
use tempfile::TempDir;

// ============================================
// Strategies
// ============================================

fn arb_digest() -> impl Strategy<Value = Digest> {
    prop::collection::vec(any::<u8>(), 64).prop_map(|v| Digest::from_slice(&v).unwrap())
}

fn arb_member_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}(\\.[a-z]{1,4})?"
}

fn arb_members() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::btree_map(
        arb_member_name(),
        prop::collection::vec(any::<u8>(), 0..2048),
        1..6,
    )
    .prop_map(|m| m.into_iter().collect())
}

fn arb_layer() -> impl Strategy<Value = ContainerLayer> {
    prop_oneof![
        Just(ContainerLayer::Content),
        Just(ContainerLayer::Initial),
        (1u32..1000).prop_map(ContainerLayer::Renewal),
    ]
}

fn write_members(dir: &Path, members: &[(String, Vec<u8>)]) {
    for (name, content) in members {
        fs::write(dir.join(name), content).unwrap();
    }
}

// ============================================
// Digest Properties
// ============================================

proptest! {
    #[test]
    fn digest_base64_roundtrip(digest in arb_digest()) {
        let text = digest.to_base64();
        prop_assert_eq!(Digest::from_base64(&text).unwrap(), digest);
    }

    #[test]
    fn streaming_digest_matches_one_shot(data in prop::collection::vec(any::<u8>(), 0..40_000)) {
        prop_assert_eq!(digest_reader(Cursor::new(&data)).unwrap(), digest_bytes(&data));
    }

    #[test]
    fn wrong_length_digest_rejected(len in 0usize..200) {
        prop_assume!(len != 64);
        let bytes = vec![0u8; len];
        prop_assert!(Digest::from_slice(&bytes).is_err());
    }
}

// ============================================
// Container Properties
// ============================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Re-hashing a freshly built container always matches the digest
    /// recorded when it was sealed
    #[test]
    fn sealed_digest_matches_rehash(members in arb_members(), layer in arb_layer()) {
        let dir = TempDir::new().unwrap();
        write_members(dir.path(), &members);

        let (path, digest) = seal(dir.path(), layer).unwrap();
        prop_assert_eq!(container_digest(&path).unwrap(), digest);
    }

    /// Extracting a container restores every member byte for byte
    #[test]
    fn extract_restores_members(members in arb_members()) {
        let dir = TempDir::new().unwrap();
        write_members(dir.path(), &members);
        let (path, _) = seal(dir.path(), ContainerLayer::Initial).unwrap();

        let out = TempDir::new().unwrap();
        extract(&path, out.path()).unwrap();
        for (name, content) in &members {
            prop_assert_eq!(&fs::read(out.path().join(name)).unwrap(), content);
        }
    }

    /// The same directory content always yields the same container bytes
    #[test]
    fn containers_are_deterministic(members in arb_members()) {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        // write in opposite orders to rule out directory-order effects
        write_members(a.path(), &members);
        let reversed: Vec<_> = members.iter().rev().cloned().collect();
        write_members(b.path(), &reversed);

        let (_, da) = seal(a.path(), ContainerLayer::Content).unwrap();
        let (_, db) = seal(b.path(), ContainerLayer::Content).unwrap();
        prop_assert_eq!(da, db);
    }

    #[test]
    fn layer_names_classify_back(layer in arb_layer()) {
        let name = layer.file_name();
        prop_assert_eq!(ContainerLayer::classify(Path::new(&name)).unwrap(), layer);
    }
}

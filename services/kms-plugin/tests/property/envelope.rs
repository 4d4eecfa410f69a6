//! Property tests for the local envelope transformer.

use kms_plugin::envelope::{EnvelopeError, EnvelopeTransformer};
use proptest::prelude::*;

fn transformer() -> EnvelopeTransformer {
    EnvelopeTransformer::new(vec![42u8; 32]).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Anything encrypted under a context decrypts under the same context.
    #[test]
    fn roundtrip_restores_plaintext(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        context in prop::collection::vec(any::<u8>(), 1..64)
    ) {
        let transformer = transformer();
        let ciphertext = transformer.transform_to_storage(&plaintext, &context).unwrap();
        let unwrapped = transformer.transform_from_storage(&ciphertext, &context).unwrap();
        prop_assert_eq!(unwrapped.plaintext, plaintext);
        prop_assert!(!unwrapped.stale);
    }

    /// Flipping any single bit of the stored form is detected.
    #[test]
    fn tampering_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..128),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8
    ) {
        let transformer = transformer();
        let mut ciphertext = transformer.transform_to_storage(&plaintext, b"uid").unwrap();
        let i = index.index(ciphertext.len());
        ciphertext[i] ^= 1 << bit;
        prop_assert!(matches!(
            transformer.transform_from_storage(&ciphertext, b"uid"),
            Err(EnvelopeError::Decrypt)
        ));
    }

    /// A different authenticated context never decrypts.
    #[test]
    fn context_is_bound(
        plaintext in prop::collection::vec(any::<u8>(), 1..128),
        context in "[a-z0-9-]{1,36}",
        other in "[a-z0-9-]{1,36}"
    ) {
        prop_assume!(context != other);
        let transformer = transformer();
        let ciphertext = transformer.transform_to_storage(&plaintext, context.as_bytes()).unwrap();
        prop_assert!(transformer.transform_from_storage(&ciphertext, other.as_bytes()).is_err());
    }
}

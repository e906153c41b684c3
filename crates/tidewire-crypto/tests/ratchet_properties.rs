//! Property tests for handshake + ratchet sessions
//!
//! Delivery order and duplication are drawn by proptest; every distinct
//! message must decrypt exactly once whatever the arrival order.

use proptest::prelude::*;
use tidewire_crypto::{
    identity::IdentityKeyPair,
    ratchet::{RatchetLimits, RatchetMessage, RatchetSession},
    x3dh::{HandshakeEngine, PreKeyManager},
    CryptoError,
};

fn handshake(one_time_prekeys: usize, limits: RatchetLimits) -> (RatchetSession, RatchetSession) {
    let alice_identity = IdentityKeyPair::generate();
    let mut bob_prekeys = PreKeyManager::new(IdentityKeyPair::generate());
    bob_prekeys.generate_one_time_prekeys(one_time_prekeys);

    let bundle = bob_prekeys.get_bundle();
    let (alice, init) = HandshakeEngine::initiate(&alice_identity, &bundle, limits).unwrap();
    let bob = HandshakeEngine::respond(&mut bob_prekeys, &init, limits).unwrap();
    (alice, bob)
}

/// Deliver `messages` in `order`; returns how many times each index decrypted
fn deliver(receiver: &mut RatchetSession, messages: &[(Vec<u8>, RatchetMessage)], order: &[usize]) -> Vec<usize> {
    let mut decrypted = vec![0usize; messages.len()];
    for &i in order {
        let (plaintext, message) = &messages[i];
        match receiver.decrypt(message) {
            Ok(out) => {
                assert_eq!(&out, plaintext);
                decrypted[i] += 1;
            }
            Err(CryptoError::DuplicateOrUnknownMessage { .. }) => {
                assert!(decrypted[i] > 0, "message {} rejected before first delivery", i);
            }
            Err(e) => panic!("unexpected error for message {}: {}", i, e),
        }
    }
    decrypted
}

fn arrival_order() -> impl Strategy<Value = Vec<usize>> {
    (Just((0..10usize).collect::<Vec<_>>()).prop_shuffle(), prop::collection::vec(0..10usize, 0..10))
        .prop_flat_map(|(order, dups)| {
            let mut all = order;
            all.extend(dups);
            Just(all).prop_shuffle()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
        let (mut alice, mut bob) = handshake(1, RatchetLimits::default());
        let message = alice.encrypt(&plaintext).unwrap();
        prop_assert_eq!(bob.decrypt(&message).unwrap(), plaintext);
    }

    #[test]
    fn prop_reordered_and_duplicated_delivery_decrypts_once(order in arrival_order()) {
        let (mut alice, mut bob) = handshake(0, RatchetLimits::default());

        let messages: Vec<_> = (0..10)
            .map(|i| {
                let plaintext = format!("message {}", i).into_bytes();
                let message = alice.encrypt(&plaintext).unwrap();
                (plaintext, message)
            })
            .collect();

        let decrypted = deliver(&mut bob, &messages, &order);
        prop_assert!(decrypted.iter().all(|&count| count == 1));
        prop_assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn prop_reordering_across_ratchet_steps(order_a in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
                                            order_b in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()) {
        let (mut alice, mut bob) = handshake(1, RatchetLimits::default());

        let first: Vec<_> = (0..5)
            .map(|i| {
                let plaintext = format!("a{}", i).into_bytes();
                (plaintext.clone(), alice.encrypt(&plaintext).unwrap())
            })
            .collect();
        prop_assert_eq!(deliver(&mut bob, &first, &order_a[..1]), {
            let mut v = vec![0; 5];
            v[order_a[0]] = 1;
            v
        });

        let reply = bob.encrypt(b"reply").unwrap();
        prop_assert_eq!(alice.decrypt(&reply).unwrap(), b"reply".to_vec());

        let second: Vec<_> = (0..5)
            .map(|i| {
                let plaintext = format!("b{}", i).into_bytes();
                (plaintext.clone(), alice.encrypt(&plaintext).unwrap())
            })
            .collect();

        let decrypted_second = deliver(&mut bob, &second, &order_b);
        let decrypted_first = deliver(&mut bob, &first, &order_a[1..]);
        prop_assert!(decrypted_second.iter().all(|&count| count == 1));
        prop_assert_eq!(decrypted_first.iter().sum::<usize>(), 4);
    }
}

#[test]
fn test_skip_limit_is_fatal_but_non_destructive() {
    let limits = RatchetLimits {
        max_skipped_message_keys: 10,
    };
    let (mut alice, mut bob) = handshake(0, limits);

    let messages: Vec<_> = (0..12).map(|_| alice.encrypt(b"x").unwrap()).collect();
    assert!(matches!(
        bob.decrypt(&messages[11]),
        Err(CryptoError::TooManySkippedMessages { gap: 11, max: 10 })
    ));
    assert_eq!(bob.decrypt(&messages[0]).unwrap(), b"x");
}

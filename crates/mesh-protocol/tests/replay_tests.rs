use mesh_protocol::crypto::{current_timestamp_secs, generate_keypair, sign_handshake, verify_handshake};
use mesh_protocol::replay::ReplayWindow;
use mesh_protocol::{Handshake, NodeId};

#[test]
fn test_fresh_nonce_accepted() {
    let mut w = ReplayWindow::new();
    let ts = current_timestamp_secs();
    assert!(w.check_and_insert("nonce-abc", ts).is_ok());
}

#[test]
fn test_replay_rejected() {
    let mut w = ReplayWindow::new();
    let ts = current_timestamp_secs();
    w.check_and_insert("nonce-abc", ts).unwrap();
    assert!(w.check_and_insert("nonce-abc", ts).is_err(), "replay should be rejected");
}

#[test]
fn test_stale_timestamp() {
    let mut w = ReplayWindow::new();
    let now = 1_000_000;
    assert!(
        w.check_and_insert_at("nonce-abc", now - 400, now).is_err(),
        "stale timestamp should be rejected"
    );
}

#[test]
fn test_future_timestamp_rejected() {
    let mut w = ReplayWindow::new();
    let now = 1_000_000;
    assert!(
        w.check_and_insert_at("nonce-abc", now + 400, now).is_err(),
        "future timestamp should be rejected"
    );
}

#[test]
fn test_nonces_expire_after_window() {
    let mut w = ReplayWindow::new();
    let now = 1_000_000;
    w.check_and_insert_at("nonce-abc", now, now).unwrap();
    assert_eq!(w.size(), 1);
    let later = now + 700;
    assert!(w.check_and_insert_at("nonce-abc", later, later).is_ok());
    assert_eq!(w.size(), 1);
}

#[test]
fn test_replayed_signed_handshake_is_caught() {
    let key = generate_keypair();
    let mut hs = Handshake::new(NodeId::new("node-a"), None);
    sign_handshake(&key, &mut hs);

    let mut w = ReplayWindow::new();
    verify_handshake(&hs).unwrap();
    w.check_and_insert(&hs.nonce, hs.timestamp).unwrap();

    // A captured handshake still verifies, but its nonce is burned.
    verify_handshake(&hs).unwrap();
    assert!(w.check_and_insert(&hs.nonce, hs.timestamp).is_err());
}

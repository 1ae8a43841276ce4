//! GET and PUT across an in-memory network.
//!
//! Run with: cargo test --test network

use std::time::Duration;

use keyroute::{
    routing::{InsertStatus, RequestStatus},
    rpc::Config,
    Block, ChkBlock, GetError, Key, PutOptions, SigningKey, SskBlock, Testnet,
};

fn config() -> Config {
    Config {
        accepted_timeout: Duration::from_secs(2),
        search_timeout: Duration::from_secs(10),
        data_insert_timeout: Duration::from_secs(2),
        transfer_completion_timeout: Duration::from_secs(5),
        completion_poll_interval: Duration::from_millis(50),
        packet_timeout: Duration::from_secs(2),
        write_local_to_datastore: true,
        ..Config::default()
    }
}

fn chk_block(fill: u8) -> ChkBlock {
    ChkBlock::new(vec![fill; 16], vec![fill; 32 * 1024])
}

#[test]
fn chk_put_then_get() {
    let testnet = Testnet::with_config(8, config()).unwrap();
    let block = chk_block(1);
    let key = Key::Chk(*block.key());

    let outcome = testnet.nodes[0]
        .put_chk(block.clone(), PutOptions::default())
        .unwrap();

    assert!(
        matches!(
            outcome.status,
            InsertStatus::Success | InsertStatus::RouteNotFound
        ),
        "unexpected {:?}",
        outcome.status
    );
    assert!(!outcome.any_transfers_failed);
    assert!(!outcome.has_collided);

    let found = testnet.nodes[4].get(&key).unwrap();
    assert_eq!(found, Block::Chk(block));
}

#[test]
fn insert_is_cached_along_the_chain() {
    let testnet = Testnet::with_config(6, config()).unwrap();
    let block = chk_block(2);
    let key = Key::Chk(*block.key());

    testnet.nodes[0]
        .put_chk(block, PutOptions::default())
        .unwrap();

    let holders = testnet
        .nodes
        .iter()
        .filter(|node| node.fetch_local(&key).is_some())
        .count();
    assert!(holders >= 2, "only {} nodes cached the insert", holders);
}

#[test]
fn missing_key_is_not_found() {
    let testnet = Testnet::with_config(5, config()).unwrap();
    let key = Key::Chk(*chk_block(3).key());

    match testnet.nodes[1].get(&key) {
        Err(GetError::Failed(RequestStatus::RouteNotFound | RequestStatus::DataNotFound)) => {}
        result => panic!("unexpected {:?}", result),
    }
}

#[test]
fn ssk_first_writer_wins() {
    let testnet = Testnet::with_config(8, config()).unwrap();
    let signer = SigningKey::from_bytes(&[3; 32]);
    let first = SskBlock::new(&signer, b"index", b"first version");
    let second = SskBlock::new(&signer, b"index", b"second version");
    let key = Key::Ssk(*first.key());

    let outcome = testnet.nodes[0]
        .put_ssk(first.clone(), PutOptions::default())
        .unwrap();
    assert!(!outcome.has_collided);

    let outcome = testnet.nodes[3]
        .put_ssk(second, PutOptions::default())
        .unwrap();
    assert!(outcome.has_collided);
    assert_eq!(outcome.canonical, Some(first.clone()));

    let found = testnet.nodes[6].get(&key).unwrap();
    assert_eq!(found, Block::Ssk(first));
}

#[test]
fn identical_ssk_insert_does_not_collide() {
    let testnet = Testnet::with_config(6, config()).unwrap();
    let signer = SigningKey::from_bytes(&[4; 32]);
    let block = SskBlock::new(&signer, b"page", b"same content");

    testnet.nodes[0]
        .put_ssk(block.clone(), PutOptions::default())
        .unwrap();
    let outcome = testnet.nodes[2]
        .put_ssk(block, PutOptions::default())
        .unwrap();

    assert!(!outcome.has_collided);
}

#[test]
fn get_survives_a_disconnected_peer() {
    let testnet = Testnet::with_config(6, config()).unwrap();
    let block = chk_block(5);
    let key = Key::Chk(*block.key());

    testnet.nodes[0]
        .put_chk(block.clone(), PutOptions::default())
        .unwrap();
    testnet.disconnect(3, 0);

    let found = testnet.nodes[3].get(&key).unwrap();
    assert_eq!(found, Block::Chk(block));
}

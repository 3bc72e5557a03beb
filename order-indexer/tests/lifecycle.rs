//! End-to-end order lifecycle scenarios against live Postgres and Redis.
//!
//! These tests need the services from the development docker-compose
//! running (`DATABASE` and `REDIS` point at them), so they are ignored by
//! default: `cargo test -- --ignored` runs them serially.

use std::sync::Arc;

use diesel::{insert_into, prelude::*};
use ethabi::Token;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, SignOnly};
use sha3::{Digest, Keccak256};
use structopt::StructOpt;
use web3::types::{Address, H256, U256};
use wyvern::{ChainInfo, OrderKind, OrderParams, Side, Signature, SignedOrder, TargetSpec};

use order_indexer::{
    db::{attributes, contracts, proxies, tokens, Database},
    events::{
        EventLog, APPROVAL_FOR_ALL_TOPIC, NONCE_INCREMENTED_TOPIC, ORDER_CANCELLED_TOPIC,
        TRANSFER_TOPIC,
    },
    orders::CandidateOrder,
    queue::JobHandler,
    utils::unix_now,
    workers::{HashUpdateHandler, HashUpdateJob, MakerUpdateHandler, MakerUpdateJob, Trigger},
    App, Options,
};

fn nft_contract() -> Address {
    "0x00000000000000000000000000000000000aaaaa".parse().unwrap()
}

fn other_party() -> Address {
    "0x00000000000000000000000000000000000eeeee".parse().unwrap()
}

fn maker_proxy() -> Address {
    "0x00000000000000000000000000000000000ddddd".parse().unwrap()
}

fn signing_context() -> Secp256k1<SignOnly> {
    Secp256k1::signing_only()
}

fn maker_secret() -> SecretKey {
    SecretKey::from_slice(&[0x42; 32]).unwrap()
}

fn maker() -> Address {
    let public = PublicKey::from_secret_key(&signing_context(), &maker_secret());
    let public = public.serialize_uncompressed();
    let mut hasher = Keccak256::new();
    hasher.update(&public[1..]);
    let hash = hasher.finalize();
    Address::from_slice(&hash[12..])
}

fn sign(params: OrderParams) -> SignedOrder {
    let digest = params.prefix_hash();
    let message = Message::from_slice(digest.as_bytes()).unwrap();
    let signature = signing_context().sign_recoverable(&message, &maker_secret());
    let (recovery_id, compact) = signature.serialize_compact();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let signature = Signature {
        v: 27 + recovery_id.to_i32() as u8,
        r: H256::from_slice(&compact[..32]),
        s: H256::from_slice(&compact[32..]),
    };
    SignedOrder {
        order: params,
        signature,
    }
}

fn sell_order(token_id: u64, nonce: u64, salt: u64) -> OrderParams {
    let chain = ChainInfo::default();
    #[allow(clippy::cast_sign_loss)]
    let now = unix_now() as u64;
    OrderParams {
        kind: OrderKind::WyvernV23,
        exchange: chain.exchange_v23,
        maker: maker(),
        taker: Address::zero(),
        maker_relayer_fee: 250.into(),
        taker_relayer_fee: 0.into(),
        fee_recipient: "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073".parse().unwrap(),
        side: Side::Sell,
        payment_token: Address::zero(),
        base_price: U256::exp10(18),
        listing_time: now - 60,
        expiration_time: now + 3600,
        salt: salt.into(),
        nonce: Some(nonce.into()),
        chain_id: 1,
        target: TargetSpec::SingleToken {
            contract: nft_contract(),
            token_id: token_id.into(),
        },
    }
}

fn buy_order(salt: u64) -> OrderParams {
    let chain = ChainInfo::default();
    OrderParams {
        side: Side::Buy,
        payment_token: chain.weth,
        target: TargetSpec::ContractWide {
            contract: nft_contract(),
        },
        ..sell_order(0, 0, salt)
    }
}

fn candidate(order: SignedOrder) -> CandidateOrder {
    CandidateOrder {
        order,
        attribute: None,
        source: None,
    }
}

fn address_topic(address: Address) -> H256 {
    H256::from(address)
}

fn uint_topic(value: U256) -> H256 {
    let mut bytes = [0_u8; 32];
    value.to_big_endian(&mut bytes);
    H256::from(bytes)
}

struct LogBuilder {
    block:      u64,
    block_hash: H256,
    log_index:  u64,
}

impl LogBuilder {
    #[allow(clippy::cast_possible_truncation)]
    fn new(block: u64) -> Self {
        Self {
            block,
            block_hash: H256::repeat_byte(block as u8),
            log_index: 0,
        }
    }

    fn next(&mut self, address: Address, topics: Vec<H256>, data: Vec<u8>) -> EventLog {
        self.log_index += 1;
        EventLog {
            address,
            topics,
            data,
            block: self.block,
            block_hash: self.block_hash,
            tx_hash: H256::from_low_u64_be(self.block * 1000 + self.log_index),
            log_index: self.log_index,
        }
    }

    fn nft_transfer(&mut self, from: Address, to: Address, token_id: u64) -> EventLog {
        self.next(
            nft_contract(),
            vec![
                *TRANSFER_TOPIC,
                address_topic(from),
                address_topic(to),
                uint_topic(token_id.into()),
            ],
            Vec::new(),
        )
    }

    fn ft_transfer(&mut self, from: Address, to: Address, amount: U256) -> EventLog {
        self.next(
            ChainInfo::default().weth,
            vec![*TRANSFER_TOPIC, address_topic(from), address_topic(to)],
            ethabi::encode(&[Token::Uint(amount)]),
        )
    }

    fn approval_for_all(&mut self, owner: Address, operator: Address) -> EventLog {
        self.next(
            nft_contract(),
            vec![
                *APPROVAL_FOR_ALL_TOPIC,
                address_topic(owner),
                address_topic(operator),
            ],
            ethabi::encode(&[Token::Bool(true)]),
        )
    }

    fn cancel(&mut self, order_hash: H256) -> EventLog {
        self.next(
            ChainInfo::default().exchange_v23,
            vec![*ORDER_CANCELLED_TOPIC, order_hash],
            Vec::new(),
        )
    }

    fn nonce_incremented(&mut self, maker: Address, new_nonce: u64) -> EventLog {
        self.next(
            ChainInfo::default().exchange_v23,
            vec![*NONCE_INCREMENTED_TOPIC, address_topic(maker)],
            ethabi::encode(&[Token::Uint(new_nonce.into())]),
        )
    }
}

async fn test_app() -> App {
    let options = Options::from_iter(&["lifecycle-test", "--master", "false"]);
    App::connect(options).await.unwrap()
}

/// Wipe every table and the queues for a clean slate.
async fn reset(app: &App) {
    app.db
        .with_connection("test_reset", |connection| {
            diesel::sql_query(
                "TRUNCATE orders, token_sets, token_sets_tokens, tokens, contracts, \
                 collections, attributes, proxies, nft_transfer_events, nft_approval_events, \
                 ft_transfer_events, ft_approval_events, cancel_events, fill_events, \
                 bulk_cancel_events, nft_balances, ft_balances, ft_approvals",
            )
            .execute(connection)?;
            Ok(())
        })
        .await
        .unwrap();
}

async fn seed_nft_contract(db: &Database) {
    db.with_connection("test_seed", |connection| {
        insert_into(contracts::table)
            .values((
                contracts::address.eq(format!("{:?}", nft_contract())),
                contracts::kind.eq("erc721"),
            ))
            .on_conflict_do_nothing()
            .execute(connection)?;
        for token_id in 1..=10_i64 {
            insert_into(tokens::table)
                .values((
                    tokens::contract.eq(format!("{:?}", nft_contract())),
                    tokens::token_id.eq(token_id.to_string()),
                ))
                .on_conflict_do_nothing()
                .execute(connection)?;
        }
        insert_into(proxies::table)
            .values((
                proxies::owner.eq(format!("{:?}", maker())),
                proxies::proxy.eq(format!("{:?}", maker_proxy())),
            ))
            .on_conflict_do_nothing()
            .execute(connection)?;
        Ok(())
    })
    .await
    .unwrap();
}

async fn run_hash_update(app: &App, hash: &str, context: &str) {
    HashUpdateHandler::new(app.db.clone())
        .process(HashUpdateJob {
            context: context.to_owned(),
            hash:    hash.to_owned(),
            trigger: Trigger::NewOrder,
        })
        .await
        .unwrap();
}

async fn run_sell_balance(app: &App, owner: Address, token_id: u64, context: &str) {
    MakerUpdateHandler::new(app.db.clone(), app.contracts.clone(), app.queues.clone())
        .process(MakerUpdateJob::SellBalance {
            context:  context.to_owned(),
            maker:    format!("{:?}", owner),
            contract: format!("{:?}", nft_contract()),
            token_id: token_id.to_string(),
        })
        .await
        .unwrap();
}

async fn run_buy_balance(app: &App, owner: Address, context: &str) {
    MakerUpdateHandler::new(app.db.clone(), app.contracts.clone(), app.queues.clone())
        .process(MakerUpdateJob::BuyBalance {
            context:  context.to_owned(),
            maker:    format!("{:?}", owner),
            contract: format!("{:?}", ChainInfo::default().weth),
        })
        .await
        .unwrap();
}

async fn fillability(app: &App, hash: &str) -> (String, i64) {
    let row = app.db.get_order(hash.to_owned()).await.unwrap().unwrap();
    (row.fillability_status, row.expiration)
}

/// Scenario: a listed token leaves and re-enters the maker's wallet.
#[tokio::test]
#[ignore]
async fn sell_balance_lifecycle() {
    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;

    // Mint the token to the maker and approve the proxy.
    let mut block99 = LogBuilder::new(99);
    let logs = vec![
        block99.nft_transfer(Address::zero(), maker(), 7),
        block99.approval_for_all(maker(), maker_proxy()),
    ];
    app.ingestor.sync(&logs, false).await.unwrap();

    let signed = sign(sell_order(7, 0, 1));
    let hash = format!("{:?}", signed.hash());
    let outcome = app.submit_orders(vec![candidate(signed.clone())]).await.unwrap();
    assert!(outcome.invalid.is_empty());
    assert_eq!(outcome.saved.len(), 1);

    run_hash_update(&app, &hash, "t1").await;
    let (status, expiration) = fillability(&app, &hash).await;
    assert_eq!(status, "fillable");
    #[allow(clippy::cast_possible_wrap)]
    let original_expiration = signed.order.expiration_time as i64;
    assert_eq!(expiration, original_expiration);
    let row = app.db.get_order(hash.clone()).await.unwrap().unwrap();
    assert_eq!(row.value, U256::exp10(18).to_string());

    // The token leaves the wallet.
    let mut block100 = LogBuilder::new(100);
    let logs = vec![block100.nft_transfer(maker(), other_party(), 7)];
    app.ingestor.sync(&logs, false).await.unwrap();
    run_sell_balance(&app, maker(), 7, "t2").await;
    run_hash_update(&app, &hash, "t3").await;
    let (status, expiration) = fillability(&app, &hash).await;
    assert_eq!(status, "no-balance");
    assert!(expiration < original_expiration);

    // And comes back.
    let mut block101 = LogBuilder::new(101);
    let logs = vec![block101.nft_transfer(other_party(), maker(), 7)];
    app.ingestor.sync(&logs, false).await.unwrap();
    run_sell_balance(&app, maker(), 7, "t4").await;
    run_hash_update(&app, &hash, "t5").await;
    let (status, expiration) = fillability(&app, &hash).await;
    assert_eq!(status, "fillable");
    assert_eq!(expiration, original_expiration);
}

/// Scenario: a nonce bump cancels everything below the new threshold.
#[tokio::test]
#[ignore]
async fn bulk_cancel_cancels_below_threshold() {
    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;

    let mut block99 = LogBuilder::new(99);
    let logs = vec![
        block99.nft_transfer(Address::zero(), maker(), 1),
        block99.nft_transfer(Address::zero(), maker(), 2),
        block99.nft_transfer(Address::zero(), maker(), 3),
        block99.approval_for_all(maker(), maker_proxy()),
    ];
    app.ingestor.sync(&logs, false).await.unwrap();

    let orders: Vec<_> = [(1, 3), (2, 5), (3, 7)]
        .iter()
        .map(|&(token_id, nonce)| sign(sell_order(token_id, nonce, u64::from(nonce))))
        .collect();
    let hashes: Vec<String> = orders.iter().map(|o| format!("{:?}", o.hash())).collect();
    let outcome = app
        .submit_orders(orders.into_iter().map(candidate).collect())
        .await
        .unwrap();
    assert_eq!(outcome.saved.len(), 3);
    for hash in &hashes {
        run_hash_update(&app, hash, "seed").await;
        assert_eq!(fillability(&app, hash).await.0, "fillable");
    }

    let mut block100 = LogBuilder::new(100);
    let logs = vec![block100.nonce_incremented(maker(), 6)];
    app.ingestor.sync(&logs, false).await.unwrap();

    assert_eq!(fillability(&app, &hashes[0]).await.0, "cancelled");
    assert_eq!(fillability(&app, &hashes[1]).await.0, "cancelled");
    assert_eq!(fillability(&app, &hashes[2]).await.0, "fillable");

    // The authoritative re-derivation agrees.
    for hash in &hashes {
        run_hash_update(&app, hash, "rederive").await;
    }
    assert_eq!(fillability(&app, &hashes[0]).await.0, "cancelled");
    assert_eq!(fillability(&app, &hashes[2]).await.0, "fillable");
}

/// Scenario: a cancellation on an orphaned block is rolled back.
#[tokio::test]
#[ignore]
async fn reorged_cancel_is_reverted() {
    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;

    let mut block99 = LogBuilder::new(99);
    let logs = vec![
        block99.nft_transfer(Address::zero(), maker(), 7),
        block99.approval_for_all(maker(), maker_proxy()),
    ];
    app.ingestor.sync(&logs, false).await.unwrap();

    let signed = sign(sell_order(7, 0, 11));
    let hash = format!("{:?}", signed.hash());
    app.submit_orders(vec![candidate(signed)]).await.unwrap();
    run_hash_update(&app, &hash, "seed").await;
    assert_eq!(fillability(&app, &hash).await.0, "fillable");

    let mut block100 = LogBuilder::new(100);
    let orphaned = block100.block_hash;
    let logs = vec![block100.cancel(hash.parse().unwrap())];
    app.ingestor.sync(&logs, false).await.unwrap();
    assert_eq!(fillability(&app, &hash).await.0, "cancelled");

    // The block is orphaned; the replacement range is empty.
    app.ingestor.fix(orphaned).await.unwrap();
    run_hash_update(&app, &hash, "revert").await;
    assert_eq!(fillability(&app, &hash).await.0, "fillable");
}

/// Scenario: a bid by an under-funded maker becomes fillable on top-up.
#[tokio::test]
#[ignore]
async fn buy_balance_tops_up() {
    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;

    let mut block99 = LogBuilder::new(99);
    let half = U256::exp10(17) * U256::from(5);
    let logs = vec![block99.ft_transfer(other_party(), maker(), half)];
    app.ingestor.sync(&logs, false).await.unwrap();

    let signed = sign(buy_order(21));
    let hash = format!("{:?}", signed.hash());
    let outcome = app.submit_orders(vec![candidate(signed)]).await.unwrap();
    assert!(outcome.invalid.is_empty());
    run_hash_update(&app, &hash, "seed").await;
    assert_eq!(fillability(&app, &hash).await.0, "no-balance");

    let mut block100 = LogBuilder::new(100);
    let topup = U256::exp10(17) * U256::from(6);
    let logs = vec![block100.ft_transfer(other_party(), maker(), topup)];
    app.ingestor.sync(&logs, false).await.unwrap();
    run_buy_balance(&app, maker(), "topup").await;
    run_hash_update(&app, &hash, "topup").await;
    assert_eq!(fillability(&app, &hash).await.0, "fillable");
}

/// Scenario: a token-list order whose root does not match is refused.
#[tokio::test]
#[ignore]
async fn attribute_order_with_wrong_root_is_refused() {
    use order_indexer::orders::AttributeDescriptor;

    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;
    app.db
        .with_connection("test_seed_attributes", |connection| {
            for token_id in [1_i64, 2, 3] {
                insert_into(attributes::table)
                    .values((
                        attributes::collection.eq("bored-apes"),
                        attributes::key.eq("fur"),
                        attributes::value.eq("gold"),
                        attributes::contract.eq(format!("{:?}", nft_contract())),
                        attributes::token_id.eq(token_id.to_string()),
                    ))
                    .on_conflict_do_nothing()
                    .execute(connection)?;
            }
            Ok(())
        })
        .await
        .unwrap();

    let params = OrderParams {
        target: TargetSpec::TokenList {
            contract:    nft_contract(),
            merkle_root: H256::repeat_byte(0x01),
        },
        ..buy_order(31)
    };
    let mut candidate = candidate(sign(params));
    candidate.attribute = Some(AttributeDescriptor {
        collection: "bored-apes".to_owned(),
        key:        "fur".to_owned(),
        value:      "gold".to_owned(),
    });
    let outcome = app.submit_orders(vec![candidate.clone()]).await.unwrap();
    assert!(outcome.saved.is_empty());
    assert_eq!(
        outcome.invalid[0].1.to_string(),
        "Order has no matching token set"
    );

    // With the root the collection actually commits to, the same order
    // is accepted.
    let root = order_indexer::token_sets::merkle::merkle_root(&[
        U256::from(1),
        U256::from(2),
        U256::from(3),
    ]);
    let params = OrderParams {
        target: TargetSpec::TokenList {
            contract: nft_contract(),
            merkle_root: root,
        },
        ..buy_order(32)
    };
    candidate.order = sign(params);
    let outcome = app.submit_orders(vec![candidate]).await.unwrap();
    assert_eq!(outcome.saved.len(), 1);
}

/// Scenario: OpenSea orders carry the fixed marketplace share, the rest
/// of the fee goes to the collection's royalty recipient.
#[tokio::test]
#[ignore]
async fn opensea_fee_attribution() {
    use order_indexer::db::collections;

    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;
    let royalty_recipient: Address =
        "0x00000000000000000000000000000000000bbbbb".parse().unwrap();
    app.db
        .with_connection("test_seed_collection", move |connection| {
            insert_into(collections::table)
                .values((
                    collections::contract.eq(format!("{:?}", nft_contract())),
                    collections::royalty_recipient.eq(Some(format!("{:?}", royalty_recipient))),
                ))
                .on_conflict_do_nothing()
                .execute(connection)?;
            Ok(())
        })
        .await
        .unwrap();

    let params = OrderParams {
        maker_relayer_fee: 500.into(),
        taker_relayer_fee: 500.into(),
        ..sell_order(7, 0, 51)
    };
    let signed = sign(params);
    let hash = format!("{:?}", signed.hash());
    let outcome = app.submit_orders(vec![candidate(signed)]).await.unwrap();
    assert!(outcome.invalid.is_empty());

    let row = app.db.get_order(hash).await.unwrap().unwrap();
    assert_eq!(row.fee_bps, 500);
    assert_eq!(
        row.source_id.as_deref(),
        Some("0x5b3256965e7c3cf26e11fcaf296dfc8807c01073")
    );
    let royalties: serde_json::Value =
        serde_json::from_str(&row.royalty_info.unwrap()).unwrap();
    assert_eq!(royalties[0]["bps"], 250);
    assert_eq!(
        royalties[0]["recipient"],
        serde_json::json!(royalty_recipient)
    );
}

/// Property: replaying a prefix of the event log is a no-op.
#[tokio::test]
#[ignore]
async fn event_replay_is_idempotent() {
    let app = test_app().await;
    reset(&app).await;
    seed_nft_contract(&app.db).await;

    let mut block99 = LogBuilder::new(99);
    let logs = vec![
        block99.nft_transfer(Address::zero(), maker(), 7),
        block99.approval_for_all(maker(), maker_proxy()),
        block99.ft_transfer(other_party(), maker(), U256::exp10(18)),
    ];
    app.ingestor.sync(&logs, false).await.unwrap();

    let signed = sign(sell_order(7, 0, 41));
    let hash = format!("{:?}", signed.hash());
    app.submit_orders(vec![candidate(signed)]).await.unwrap();
    run_hash_update(&app, &hash, "first").await;
    let baseline = app.db.get_order(hash.clone()).await.unwrap().unwrap();
    let balance = app
        .db
        .nft_balance(
            format!("{:?}", nft_contract()),
            "7".to_owned(),
            format!("{:?}", maker()),
        )
        .await
        .unwrap();
    assert_eq!(balance, "1");

    // Replay the whole batch twice more.
    app.ingestor.sync(&logs, false).await.unwrap();
    app.ingestor.sync(&logs, false).await.unwrap();
    run_hash_update(&app, &hash, "replay").await;

    let replayed = app.db.get_order(hash.clone()).await.unwrap().unwrap();
    assert_eq!(replayed.fillability_status, baseline.fillability_status);
    assert_eq!(replayed.quantity_remaining, baseline.quantity_remaining);
    assert_eq!(replayed.expiration, baseline.expiration);
    let balance = app
        .db
        .nft_balance(
            format!("{:?}", nft_contract()),
            "7".to_owned(),
            format!("{:?}", maker()),
        )
        .await
        .unwrap();
    assert_eq!(balance, "1");
}

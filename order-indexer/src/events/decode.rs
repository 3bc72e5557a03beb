//! Decode raw chain logs into typed domain events.
//!
//! ERC20 and ERC721 share the `Transfer` and `Approval` signatures; they
//! are told apart by the number of indexed topics (ERC721 indexes the
//! token id). Logs with unknown topics are not ours and decode to
//! nothing; malformed logs with known topics are an error the caller
//! logs and skips.

use ethabi::ParamType;
use once_cell::sync::Lazy;
use thiserror::Error;
use web3::types::{Address, H256, U256};
use wyvern::utils::keccak256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub address:    Address,
    pub topics:     Vec<H256>,
    pub data:       Vec<u8>,
    pub block:      u64,
    pub block_hash: H256,
    pub tx_hash:    H256,
    pub log_index:  u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("log is missing an indexed topic")]
    MissingTopic,
    #[error("log data does not decode")]
    Data(#[from] ethabi::Error),
    #[error("log data has an unexpected shape")]
    Shape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    OrderCancelled {
        order_hash: H256,
    },
    OrdersMatched {
        buy_hash:  H256,
        sell_hash: H256,
        maker:     Address,
        taker:     Address,
        price:     U256,
    },
    NonceIncremented {
        maker:     Address,
        new_nonce: U256,
    },
    NftTransfer {
        contract:    Address,
        token_id:    U256,
        sender:      Address,
        recipient:   Address,
        amount:      U256,
        batch_index: u64,
    },
    NftApproval {
        contract: Address,
        owner:    Address,
        operator: Address,
        approved: bool,
    },
    FtTransfer {
        contract:  Address,
        sender:    Address,
        recipient: Address,
        amount:    U256,
    },
    FtApproval {
        contract: Address,
        owner:    Address,
        spender:  Address,
        amount:   U256,
    },
}

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

pub static TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("Transfer(address,address,uint256)"));
pub static APPROVAL_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("Approval(address,address,uint256)"));
pub static APPROVAL_FOR_ALL_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("ApprovalForAll(address,address,bool)"));
pub static TRANSFER_SINGLE_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("TransferSingle(address,address,address,uint256,uint256)"));
pub static TRANSFER_BATCH_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("TransferBatch(address,address,address,uint256[],uint256[])"));
pub static ORDER_CANCELLED_TOPIC: Lazy<H256> = Lazy::new(|| event_topic("OrderCancelled(bytes32)"));
pub static ORDERS_MATCHED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("OrdersMatched(bytes32,bytes32,address,address,uint256,bytes32)"));
pub static NONCE_INCREMENTED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("NonceIncremented(address,uint256)"));

fn topic(log: &EventLog, index: usize) -> Result<H256, Error> {
    log.topics.get(index).copied().ok_or(Error::MissingTopic)
}

fn topic_address(log: &EventLog, index: usize) -> Result<Address, Error> {
    Ok(Address::from_slice(&topic(log, index)?.as_bytes()[12..]))
}

fn single_uint(data: &[u8]) -> Result<U256, Error> {
    ethabi::decode(&[ParamType::Uint(256)], data)?
        .into_iter()
        .next()
        .and_then(ethabi::Token::into_uint)
        .ok_or(Error::Shape)
}

/// Decode one log into zero or more domain events. Zero means the log is
/// not one we track.
pub fn decode(log: &EventLog) -> Result<Vec<ChainEvent>, Error> {
    let topic0 = match log.topics.first() {
        Some(topic0) => *topic0,
        None => return Ok(Vec::new()),
    };

    if topic0 == *TRANSFER_TOPIC {
        // Three topics: ERC20 (amount in data). Four: ERC721 (token id
        // indexed, implicit amount of one).
        return match log.topics.len() {
            3 => Ok(vec![ChainEvent::FtTransfer {
                contract:  log.address,
                sender:    topic_address(log, 1)?,
                recipient: topic_address(log, 2)?,
                amount:    single_uint(&log.data)?,
            }]),
            4 => Ok(vec![ChainEvent::NftTransfer {
                contract:    log.address,
                token_id:    U256::from_big_endian(topic(log, 3)?.as_bytes()),
                sender:      topic_address(log, 1)?,
                recipient:   topic_address(log, 2)?,
                amount:      U256::one(),
                batch_index: 0,
            }]),
            _ => Err(Error::Shape),
        };
    }

    if topic0 == *APPROVAL_TOPIC {
        // The four-topic form is ERC721's per-token approval, which the
        // orderbook does not track.
        return match log.topics.len() {
            3 => Ok(vec![ChainEvent::FtApproval {
                contract: log.address,
                owner:    topic_address(log, 1)?,
                spender:  topic_address(log, 2)?,
                amount:   single_uint(&log.data)?,
            }]),
            4 => Ok(Vec::new()),
            _ => Err(Error::Shape),
        };
    }

    if topic0 == *APPROVAL_FOR_ALL_TOPIC {
        let approved = ethabi::decode(&[ParamType::Bool], &log.data)?
            .into_iter()
            .next()
            .and_then(ethabi::Token::into_bool)
            .ok_or(Error::Shape)?;
        return Ok(vec![ChainEvent::NftApproval {
            contract: log.address,
            owner: topic_address(log, 1)?,
            operator: topic_address(log, 2)?,
            approved,
        }]);
    }

    if topic0 == *TRANSFER_SINGLE_TOPIC {
        let tokens = ethabi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &log.data)?;
        let (token_id, amount) = match tokens.as_slice() {
            [id, value] => (
                id.clone().into_uint().ok_or(Error::Shape)?,
                value.clone().into_uint().ok_or(Error::Shape)?,
            ),
            _ => return Err(Error::Shape),
        };
        return Ok(vec![ChainEvent::NftTransfer {
            contract: log.address,
            token_id,
            sender: topic_address(log, 2)?,
            recipient: topic_address(log, 3)?,
            amount,
            batch_index: 0,
        }]);
    }

    if topic0 == *TRANSFER_BATCH_TOPIC {
        let array = ParamType::Array(Box::new(ParamType::Uint(256)));
        let tokens = ethabi::decode(&[array.clone(), array], &log.data)?;
        let (ids, values) = match tokens.as_slice() {
            [ids, values] => (
                ids.clone().into_array().ok_or(Error::Shape)?,
                values.clone().into_array().ok_or(Error::Shape)?,
            ),
            _ => return Err(Error::Shape),
        };
        if ids.len() != values.len() {
            return Err(Error::Shape);
        }
        let sender = topic_address(log, 2)?;
        let recipient = topic_address(log, 3)?;
        return ids
            .into_iter()
            .zip(values)
            .enumerate()
            .map(|(batch_index, (id, value))| {
                Ok(ChainEvent::NftTransfer {
                    contract:    log.address,
                    token_id:    id.into_uint().ok_or(Error::Shape)?,
                    sender,
                    recipient,
                    amount:      value.into_uint().ok_or(Error::Shape)?,
                    batch_index: batch_index as u64,
                })
            })
            .collect();
    }

    if topic0 == *ORDER_CANCELLED_TOPIC {
        // v2.3 indexes the hash; v2 carries it in the data.
        let order_hash = if log.topics.len() >= 2 {
            topic(log, 1)?
        } else {
            ethabi::decode(&[ParamType::FixedBytes(32)], &log.data)?
                .into_iter()
                .next()
                .and_then(ethabi::Token::into_fixed_bytes)
                .filter(|bytes| bytes.len() == 32)
                .map(|bytes| H256::from_slice(&bytes))
                .ok_or(Error::Shape)?
        };
        return Ok(vec![ChainEvent::OrderCancelled { order_hash }]);
    }

    if topic0 == *ORDERS_MATCHED_TOPIC {
        let tokens = ethabi::decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
            ],
            &log.data,
        )?;
        let (buy_hash, sell_hash, price) = match tokens.as_slice() {
            [buy, sell, price] => (
                buy.clone()
                    .into_fixed_bytes()
                    .filter(|bytes| bytes.len() == 32)
                    .map(|bytes| H256::from_slice(&bytes))
                    .ok_or(Error::Shape)?,
                sell.clone()
                    .into_fixed_bytes()
                    .filter(|bytes| bytes.len() == 32)
                    .map(|bytes| H256::from_slice(&bytes))
                    .ok_or(Error::Shape)?,
                price.clone().into_uint().ok_or(Error::Shape)?,
            ),
            _ => return Err(Error::Shape),
        };
        return Ok(vec![ChainEvent::OrdersMatched {
            buy_hash,
            sell_hash,
            maker: topic_address(log, 1)?,
            taker: topic_address(log, 2)?,
            price,
        }]);
    }

    if topic0 == *NONCE_INCREMENTED_TOPIC {
        return Ok(vec![ChainEvent::NonceIncremented {
            maker:     topic_address(log, 1)?,
            new_nonce: single_uint(&log.data)?,
        }]);
    }

    Ok(Vec::new())
}

#[cfg(test)]
pub mod test {
    use ethabi::Token;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;

    use super::*;

    fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn address_topic(address: Address) -> H256 {
        H256::from(address)
    }

    fn log(topics: Vec<H256>, data: Vec<u8>) -> EventLog {
        EventLog {
            address: address(0xcc),
            topics,
            data,
            block: 100,
            block_hash: H256::repeat_byte(0xbb),
            tx_hash: H256::repeat_byte(0x77),
            log_index: 3,
        }
    }

    #[test]
    fn test_known_topic_constants() {
        assert_eq!(
            *TRANSFER_TOPIC,
            H256::from(hex!(
                "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
            ))
        );
        assert_eq!(
            *APPROVAL_TOPIC,
            H256::from(hex!(
                "8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925"
            ))
        );
        assert_eq!(
            *APPROVAL_FOR_ALL_TOPIC,
            H256::from(hex!(
                "17307eab39ab6107e8899845ad3d59bd9653f200f220920489ca2b5937696c31"
            ))
        );
        assert_eq!(
            *TRANSFER_SINGLE_TOPIC,
            H256::from(hex!(
                "c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62"
            ))
        );
        assert_eq!(
            *TRANSFER_BATCH_TOPIC,
            H256::from(hex!(
                "4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb"
            ))
        );
    }

    #[test]
    fn test_decode_erc721_transfer() {
        let token_id = U256::from(7);
        let mut id_topic = [0_u8; 32];
        token_id.to_big_endian(&mut id_topic);
        let events = decode(&log(
            vec![
                *TRANSFER_TOPIC,
                address_topic(address(0x11)),
                address_topic(address(0x22)),
                H256::from(id_topic),
            ],
            Vec::new(),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![ChainEvent::NftTransfer {
                contract:    address(0xcc),
                token_id,
                sender:      address(0x11),
                recipient:   address(0x22),
                amount:      U256::one(),
                batch_index: 0,
            }]
        );
    }

    #[test]
    fn test_decode_erc20_transfer() {
        let events = decode(&log(
            vec![
                *TRANSFER_TOPIC,
                address_topic(address(0x11)),
                address_topic(address(0x22)),
            ],
            ethabi::encode(&[Token::Uint(U256::from(500))]),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![ChainEvent::FtTransfer {
                contract:  address(0xcc),
                sender:    address(0x11),
                recipient: address(0x22),
                amount:    U256::from(500),
            }]
        );
    }

    #[test]
    fn test_decode_approval_for_all() {
        let events = decode(&log(
            vec![
                *APPROVAL_FOR_ALL_TOPIC,
                address_topic(address(0x11)),
                address_topic(address(0x33)),
            ],
            ethabi::encode(&[Token::Bool(true)]),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![ChainEvent::NftApproval {
                contract: address(0xcc),
                owner:    address(0x11),
                operator: address(0x33),
                approved: true,
            }]
        );
    }

    #[test]
    fn test_decode_transfer_batch() {
        let events = decode(&log(
            vec![
                *TRANSFER_BATCH_TOPIC,
                address_topic(address(0x01)),
                address_topic(address(0x11)),
                address_topic(address(0x22)),
            ],
            ethabi::encode(&[
                Token::Array(vec![Token::Uint(1.into()), Token::Uint(2.into())]),
                Token::Array(vec![Token::Uint(10.into()), Token::Uint(20.into())]),
            ]),
        ))
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ChainEvent::NftTransfer {
                contract:    address(0xcc),
                token_id:    U256::from(2),
                sender:      address(0x11),
                recipient:   address(0x22),
                amount:      U256::from(20),
                batch_index: 1,
            }
        );
    }

    #[test]
    fn test_decode_orders_matched() {
        let buy = H256::repeat_byte(0x0b);
        let sell = H256::repeat_byte(0x05);
        let events = decode(&log(
            vec![
                *ORDERS_MATCHED_TOPIC,
                address_topic(address(0x11)),
                address_topic(address(0x22)),
                H256::zero(),
            ],
            ethabi::encode(&[
                Token::FixedBytes(buy.as_bytes().to_vec()),
                Token::FixedBytes(sell.as_bytes().to_vec()),
                Token::Uint(U256::exp10(18)),
            ]),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![ChainEvent::OrdersMatched {
                buy_hash:  buy,
                sell_hash: sell,
                maker:     address(0x11),
                taker:     address(0x22),
                price:     U256::exp10(18),
            }]
        );
    }

    #[test]
    fn test_decode_nonce_incremented() {
        let events = decode(&log(
            vec![*NONCE_INCREMENTED_TOPIC, address_topic(address(0x11))],
            ethabi::encode(&[Token::Uint(U256::from(6))]),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![ChainEvent::NonceIncremented {
                maker:     address(0x11),
                new_nonce: U256::from(6),
            }]
        );
    }

    #[test]
    fn test_decode_indexed_cancel() {
        let hash = H256::repeat_byte(0x42);
        let events = decode(&log(vec![*ORDER_CANCELLED_TOPIC, hash], Vec::new())).unwrap();
        assert_eq!(events, vec![ChainEvent::OrderCancelled { order_hash: hash }]);
    }

    #[test]
    fn test_unknown_topics_decode_to_nothing() {
        let events = decode(&log(vec![H256::repeat_byte(0x99)], Vec::new())).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_known_log_is_an_error() {
        let result = decode(&log(
            vec![
                *TRANSFER_TOPIC,
                address_topic(address(0x11)),
                address_topic(address(0x22)),
            ],
            vec![0x01, 0x02],
        ));
        assert!(result.is_err());
    }
}

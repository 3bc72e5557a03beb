#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
//! Typed Wyvern exchange orders.
//!
//! This crate is the marketplace SDK the order indexer trusts: order
//! parameter types, the order content hash and its eth_sign prefix hash,
//! maker signature recovery, target-asset introspection and the minimal
//! read/write surface over the exchange contracts (proxy registry, WETH,
//! ERC721/1155 helpers, match/cancel transaction payloads).

mod chain;
mod contracts;
mod order;
mod signature;
pub mod utils;

pub use self::{
    chain::ChainInfo,
    contracts::{Contracts, Error as ContractError, TransactionData},
    order::{Error, OrderKind, OrderParams, Side, TargetSpec},
    signature::{Signature, SignedOrder},
};

#[cfg(feature = "bench")]
pub mod bench {
    use criterion::Criterion;

    pub fn main(criterion: &mut Criterion) {
        crate::order::bench::group(criterion);
    }
}

/// Return early with an error if a condition is not satisfied.
#[macro_export]
macro_rules! require {
    ($condition:expr, $err:expr $(,)?) => {
        if !$condition {
            return Err($err);
        }
    };
}

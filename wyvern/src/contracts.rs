//! Thin call surface over the exchange, proxy registry and token
//! contracts. Calldata is encoded by hand from canonical signatures so no
//! ABI artifacts need to be vendored.

use ethabi::{ParamType, Token};
use thiserror::Error;
use web3::{
    transports::Http,
    types::{Address, Bytes, CallRequest, U256},
    Web3,
};

use crate::{
    chain::ChainInfo,
    order::{OrderParams, Side},
    utils::selector,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("eth_call failed")]
    Web3(#[from] web3::Error),
    #[error("could not decode call output")]
    Abi(#[from] ethabi::Error),
    #[error("call output is missing an element")]
    EmptyOutput,
}

/// A wallet-ready transaction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub from:  Address,
    pub to:    Address,
    pub data:  Vec<u8>,
    pub value: U256,
}

#[derive(Clone, Debug)]
pub struct Contracts {
    web3:      Web3<Http>,
    pub chain: ChainInfo,
}

fn call_data(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(ethabi::encode(args));
    data
}

fn tokenize_order(order: &OrderParams) -> Token {
    Token::Tuple(vec![
        Token::Address(order.exchange),
        Token::Address(order.maker),
        Token::Address(order.taker),
        Token::Uint(order.maker_relayer_fee),
        Token::Uint(order.taker_relayer_fee),
        Token::Address(order.fee_recipient),
        Token::Uint(u8::from(order.side).into()),
        Token::Address(order.target.contract()),
        Token::FixedBytes(order.target.data_hash().as_bytes().to_vec()),
        Token::Address(order.payment_token),
        Token::Uint(order.base_price),
        Token::Uint(order.listing_time.into()),
        Token::Uint(order.expiration_time.into()),
        Token::Uint(order.salt),
    ])
}

impl Contracts {
    #[must_use]
    pub const fn new(web3: Web3<Http>, chain: ChainInfo) -> Self {
        Self { web3, chain }
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        let request = CallRequest {
            to: Some(to),
            data: Some(Bytes(data)),
            ..CallRequest::default()
        };
        let output = self.web3.eth().call(request, None).await?;
        Ok(output.0)
    }

    async fn call_uint(&self, to: Address, data: Vec<u8>) -> Result<U256, Error> {
        let output = self.call(to, data).await?;
        let tokens = ethabi::decode(&[ParamType::Uint(256)], &output)?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or(Error::EmptyOutput)
    }

    async fn call_address(&self, to: Address, data: Vec<u8>) -> Result<Address, Error> {
        let output = self.call(to, data).await?;
        let tokens = ethabi::decode(&[ParamType::Address], &output)?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_address)
            .ok_or(Error::EmptyOutput)
    }

    /// The maker's registered user proxy, if any.
    pub async fn get_proxy(&self, owner: Address) -> Result<Option<Address>, Error> {
        let data = call_data("proxies(address)", &[Token::Address(owner)]);
        let proxy = self.call_address(self.chain.proxy_registry, data).await?;
        Ok(if proxy.is_zero() { None } else { Some(proxy) })
    }

    pub async fn ft_balance(&self, token: Address, owner: Address) -> Result<U256, Error> {
        let data = call_data("balanceOf(address)", &[Token::Address(owner)]);
        self.call_uint(token, data).await
    }

    pub async fn ft_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, Error> {
        let data = call_data(
            "allowance(address,address)",
            &[Token::Address(owner), Token::Address(spender)],
        );
        self.call_uint(token, data).await
    }

    pub async fn erc721_owner(&self, contract: Address, token_id: U256) -> Result<Address, Error> {
        let data = call_data("ownerOf(uint256)", &[Token::Uint(token_id)]);
        self.call_address(contract, data).await
    }

    pub async fn erc1155_balance(
        &self,
        contract: Address,
        owner: Address,
        token_id: U256,
    ) -> Result<U256, Error> {
        let data = call_data(
            "balanceOf(address,uint256)",
            &[Token::Address(owner), Token::Uint(token_id)],
        );
        self.call_uint(contract, data).await
    }

    pub async fn is_approved_for_all(
        &self,
        contract: Address,
        owner: Address,
        operator: Address,
    ) -> Result<bool, Error> {
        let data = call_data(
            "isApprovedForAll(address,address)",
            &[Token::Address(owner), Token::Address(operator)],
        );
        let output = self.call(contract, data).await?;
        let tokens = ethabi::decode(&[ParamType::Bool], &output)?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_bool)
            .ok_or(Error::EmptyOutput)
    }

    #[must_use]
    pub fn register_proxy_transaction(&self, owner: Address) -> TransactionData {
        TransactionData {
            from:  owner,
            to:    self.chain.proxy_registry,
            data:  call_data("registerProxy()", &[]),
            value: U256::zero(),
        }
    }

    #[must_use]
    pub fn weth_deposit_transaction(&self, owner: Address, amount: U256) -> TransactionData {
        TransactionData {
            from:  owner,
            to:    self.chain.weth,
            data:  call_data("deposit()", &[]),
            value: amount,
        }
    }

    #[must_use]
    pub fn weth_approve_transaction(
        &self,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> TransactionData {
        TransactionData {
            from:  owner,
            to:    self.chain.weth,
            data:  call_data(
                "approve(address,uint256)",
                &[Token::Address(spender), Token::Uint(amount)],
            ),
            value: U256::zero(),
        }
    }

    #[must_use]
    pub fn nft_approve_transaction(
        &self,
        contract: Address,
        owner: Address,
        operator: Address,
    ) -> TransactionData {
        TransactionData {
            from:  owner,
            to:    contract,
            data:  call_data(
                "setApprovalForAll(address,bool)",
                &[Token::Address(operator), Token::Bool(true)],
            ),
            value: U256::zero(),
        }
    }

    /// Cancellation must be sent by the order's maker.
    #[must_use]
    pub fn cancel_transaction(&self, maker: Address, order: &OrderParams) -> TransactionData {
        TransactionData {
            from:  maker,
            to:    order.exchange,
            data:  call_data(
                "cancelOrder((address,address,address,uint256,uint256,address,uint8,address,\
                 bytes32,address,uint256,uint256,uint256,uint256))",
                &[tokenize_order(order)],
            ),
            value: U256::zero(),
        }
    }

    /// Match a buy against a sell. Ether value is attached only when the
    /// sale settles in the native currency.
    #[must_use]
    pub fn match_transaction(
        &self,
        taker: Address,
        buy: &OrderParams,
        sell: &OrderParams,
    ) -> TransactionData {
        debug_assert_eq!(buy.side, Side::Buy);
        debug_assert_eq!(sell.side, Side::Sell);
        let value = if sell.payment_token.is_zero() {
            sell.base_price
        } else {
            U256::zero()
        };
        TransactionData {
            from: taker,
            to: sell.exchange,
            data: call_data(
                "atomicMatch((address,address,address,uint256,uint256,address,uint8,address,\
                 bytes32,address,uint256,uint256,uint256,uint256),(address,address,address,\
                 uint256,uint256,address,uint8,address,bytes32,address,uint256,uint256,uint256,\
                 uint256))",
                &[tokenize_order(buy), tokenize_order(sell)],
            ),
            value,
        }
    }
}

use anyhow::{anyhow, Error as AnyError, Result as AnyResult};
use chrono::offset::Utc;
use core::future::Future;
use futures::FutureExt;
use tokio::spawn;
use tracing::error;
use web3::types::{Address, H256, U256};

/// Return early with an error if a condition is not satisfied.
#[macro_export]
macro_rules! require {
    ($condition:expr, $err:expr $(,)?) => {
        if !$condition {
            return Err($err);
        }
    };
}

pub trait Any<T> {
    fn any(self) -> AnyResult<T>;
}

impl<T, E: Into<AnyError>> Any<T> for Result<T, E> {
    fn any(self) -> AnyResult<T> {
        self.map_err(Into::into)
    }
}

pub trait AnyFlatten<T> {
    fn any_flatten(self) -> AnyResult<T>;
}

impl<T, E: Into<AnyError>, F: Into<AnyError>> AnyFlatten<T> for Result<Result<T, F>, E> {
    fn any_flatten(self) -> AnyResult<T> {
        match self {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(error.into()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Spawn a task that takes the whole process down if it fails.
pub fn spawn_or_abort<F>(future: F)
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    spawn(future.map(|result| {
        if let Err(error) = result {
            error!(?error, "Error in task");
            std::process::abort();
        }
    }));
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

pub fn parse_address(s: &str) -> AnyResult<Address> {
    s.trim_start_matches("0x")
        .parse()
        .map_err(|_| anyhow!("invalid hex string for address: {:?}", s))
}

pub fn parse_h256(s: &str) -> AnyResult<H256> {
    s.trim_start_matches("0x")
        .parse()
        .map_err(|_| anyhow!("invalid hex string for H256: {:?}", s))
}

pub fn parse_u256(s: &str) -> AnyResult<U256> {
    U256::from_dec_str(s).map_err(|_| anyhow!("invalid decimal string for U256: {:?}", s))
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_address_roundtrip() {
        let address: Address = "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073".parse().unwrap();
        assert_eq!(parse_address(&format!("{:?}", address)).unwrap(), address);
    }

    #[test]
    fn test_parse_u256_rejects_hex() {
        assert!(parse_u256("0x10").is_err());
        assert_eq!(parse_u256("10").unwrap(), U256::from(10));
    }

    #[test]
    fn test_any_flatten() {
        let nested: Result<AnyResult<u32>, std::io::Error> = Ok(Ok(7));
        assert_eq!(nested.any_flatten().unwrap(), 7);
    }
}

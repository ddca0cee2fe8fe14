use ethers::types::Address;
use ethers::utils::to_checksum;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid wallet address {0:?}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAddress {
    pub address: Address,
    pub checksummed: String,
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed)
    }
}

pub fn canonicalize_wallet(raw: &str) -> Result<WalletAddress, AddressError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") && !trimmed.starts_with("0X") {
        return Err(AddressError::Invalid(trimmed.to_string()));
    }
    let address =
        Address::from_str(trimmed).map_err(|_| AddressError::Invalid(trimmed.to_string()))?;
    Ok(WalletAddress {
        address,
        checksummed: to_checksum(&address, None),
    })
}

//! Subaddress derivation from a user's view/spend key material.
//!
//! Addresses are issued deterministically by advancing a `(major, minor)`
//! index pair per user. The cursor lives with the user's key row in storage;
//! this module owns parsing, the index carry rule, and the derivation itself.

use std::str::FromStr;

use monero::{
    cryptonote::subaddress::{self, Index},
    Network, PrivateKey, PublicKey, ViewPair,
};
use thiserror::Error;

use crate::invoice::XmrKeys;

/// Advance a subaddress index cursor: the minor index increments, carrying
/// into the major index when it wraps.
#[must_use]
pub fn next_index(major: u32, minor: u32) -> (u32, u32) {
    let minor = minor.wrapping_add(1);
    if minor == 0 {
        (major.wrapping_add(1), minor)
    } else {
        (major, minor)
    }
}

/// Parse a hex encoded private view key.
///
/// # Errors
///
/// Returns a [`KeyError::Parse`] if the input is not a valid key. The input
/// is redacted from the error.
pub fn parse_view_key(hex_key: &str) -> Result<PrivateKey, KeyError> {
    PrivateKey::from_str(hex_key).map_err(|e| KeyError::Parse {
        datatype: "PrivateKey",
        input: "[REDACTED]".to_string(),
        error: e.to_string(),
    })
}

/// Parse a hex encoded public spend key.
///
/// # Errors
///
/// Returns a [`KeyError::Parse`] if the input is not a valid key.
pub fn parse_spend_key(hex_key: &str) -> Result<PublicKey, KeyError> {
    PublicKey::from_str(hex_key).map_err(|e| KeyError::Parse {
        datatype: "PublicKey",
        input: hex_key.to_string(),
        error: e.to_string(),
    })
}

/// Build a [`ViewPair`] from stored key material.
///
/// # Errors
///
/// Returns a [`KeyError::Parse`] if either key is invalid.
pub fn view_pair(keys: &XmrKeys) -> Result<ViewPair, KeyError> {
    Ok(ViewPair {
        view: parse_view_key(&keys.priv_view_key)?,
        spend: parse_spend_key(&keys.pub_spend_key)?,
    })
}

/// Derive the base58 subaddress for `(major, minor)` on the given network.
///
/// # Errors
///
/// Returns a [`KeyError::Parse`] if the stored key material is invalid.
pub fn derive(
    keys: &XmrKeys,
    major: u32,
    minor: u32,
    network: Network,
) -> Result<String, KeyError> {
    let viewpair = view_pair(keys)?;
    let address = subaddress::get_subaddress(&viewpair, Index { major, minor }, Some(network));
    Ok(address.to_string())
}

/// An error parsing key material.
#[derive(Error, Debug)]
pub enum KeyError {
    /// Input could not be parsed as the named type.
    #[error("failed to parse {datatype} from \"{input}\": {error}")]
    Parse {
        /// Type to parse.
        datatype: &'static str,
        /// Input to parse.
        input: String,
        /// Error encountered.
        error: String,
    },
}

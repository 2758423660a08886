#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

mod daemon;

use std::str::FromStr;

pub use daemon::MockDaemon;
use monero::{
    blockdata::transaction::{RawExtraField, Transaction, TransactionPrefix},
    util::ringct::RctSig,
    Address, VarInt,
};

pub const PRIVATE_VIEW_KEY: &str =
    "ad2093a5705b9f33e6f0f0c1bc1f5f639c756cdfc168c8f2ac6127ccbdab3a03";
pub const PRIMARY_ADDRESS: &str =
    "4613YiHLM6JMH4zejMB2zJY5TwQCxL8p65ufw8kBP5yxX9itmuGLqp1dS4tkVoTxjyH3aYhYNrtGHbQzJQP5bFus3KHVdmf";

/// Hex encoding of the public spend key behind [`PRIMARY_ADDRESS`].
#[must_use]
pub fn pub_spend_key_hex() -> String {
    let address = Address::from_str(PRIMARY_ADDRESS).expect("primary address is valid");
    address.public_spend.to_string()
}

/// A structurally valid transaction with no inputs or outputs.
#[must_use]
pub fn empty_transaction() -> Transaction {
    Transaction {
        prefix: TransactionPrefix {
            version: VarInt(2),
            unlock_time: VarInt(0),
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra: RawExtraField(Vec::new()),
        },
        signatures: Vec::new(),
        rct_signatures: RctSig { sig: None, p: None },
    }
}

/// Initialize the logging implementation.
pub fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

//! Sender recovery for transactions reported by `eth_getBlockByNumber`.
//!
//! The signing payload is rebuilt from the reported fields. The re-encoded
//! signed transaction must hash to the reported hash, and the signer is
//! recovered from the signature over the signing hash.

use std::str::FromStr;

use alloy_consensus::{SignableTransaction, TxEip1559, TxEip2930, TxEip4844, TxEip7702, TxLegacy};
use alloy_primitives::{Address, Signature, TxKind, B256};

use chainsync_core::chain::ChainTransaction;

const EIP155_V_OFFSET: u64 = 35;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    #[error("transaction is not signed")]
    Unsigned,

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },

    #[error("unsupported transaction type {0}")]
    UnsupportedType(u64),

    #[error("signed for chain {signed}, expected chain {expected}")]
    ChainMismatch { signed: u64, expected: u64 },

    #[error("reported hash {reported} does not match the signed payload ({computed})")]
    HashMismatch { reported: B256, computed: B256 },

    #[error("signature does not verify: {0}")]
    BadSignature(String),
}

/// Hashes of a signed transaction: `(signing hash, transaction hash)`.
macro_rules! seal {
    ($tx:expr, $signature:expr) => {{
        let tx = $tx;
        let signing_hash = tx.signature_hash();
        let signed = tx.into_signed($signature);
        (signing_hash, *signed.hash())
    }};
}

/// Address that signed `tx`, which must be signed for `chain_id`.
///
/// Unprotected legacy transactions (`v` of 27 or 28) commit to no chain and
/// are accepted on any chain, as an EIP-155 signer does.
pub fn recover_signer(tx: &ChainTransaction, chain_id: u64) -> Result<Address, SignerError> {
    let (Some(r), Some(s)) = (tx.r, tx.s) else {
        return Err(SignerError::Unsigned);
    };
    let reported = B256::from_str(&tx.hash).map_err(|_| invalid("hash", &tx.hash))?;
    let value = tx.value.as_u256();
    let input = tx.input.clone();

    let tx_type = tx.tx_type.unwrap_or(0);
    if tx_type == 0 {
        let (signed_chain, odd) = legacy_parity(tx.v.ok_or(SignerError::Unsigned)?)?;
        if let Some(signed) = signed_chain {
            ensure_chain(signed, chain_id)?;
        }
        let signature = Signature::new(r, s, odd);
        let (signing_hash, computed) = seal!(
            TxLegacy {
                chain_id: signed_chain,
                nonce: tx.nonce,
                gas_price: required(tx.gas_price, "gasPrice")?,
                gas_limit: required(tx.gas, "gas")?,
                to: tx_kind(tx)?,
                value,
                input,
            },
            signature
        );
        return verify(signature, signing_hash, computed, reported);
    }

    let signed_chain = required(tx.chain_id, "chainId")?;
    ensure_chain(signed_chain, chain_id)?;
    let signature = Signature::new(r, s, y_parity(tx)?);
    let access_list = tx.access_list.clone().unwrap_or_default();
    let gas_limit = required(tx.gas, "gas")?;

    let (signing_hash, computed) = match tx_type {
        1 => seal!(
            TxEip2930 {
                chain_id: signed_chain,
                nonce: tx.nonce,
                gas_price: required(tx.gas_price, "gasPrice")?,
                gas_limit,
                to: tx_kind(tx)?,
                value,
                access_list,
                input,
            },
            signature
        ),
        2 => seal!(
            TxEip1559 {
                chain_id: signed_chain,
                nonce: tx.nonce,
                gas_limit,
                max_fee_per_gas: required(tx.max_fee_per_gas, "maxFeePerGas")?,
                max_priority_fee_per_gas: required(
                    tx.max_priority_fee_per_gas,
                    "maxPriorityFeePerGas"
                )?,
                to: tx_kind(tx)?,
                value,
                access_list,
                input,
            },
            signature
        ),
        3 => seal!(
            TxEip4844 {
                chain_id: signed_chain,
                nonce: tx.nonce,
                gas_limit,
                max_fee_per_gas: required(tx.max_fee_per_gas, "maxFeePerGas")?,
                max_priority_fee_per_gas: required(
                    tx.max_priority_fee_per_gas,
                    "maxPriorityFeePerGas"
                )?,
                to: call_target(tx)?,
                value,
                access_list,
                blob_versioned_hashes: tx.blob_versioned_hashes.clone().unwrap_or_default(),
                max_fee_per_blob_gas: required(tx.max_fee_per_blob_gas, "maxFeePerBlobGas")?,
                input,
            },
            signature
        ),
        4 => seal!(
            TxEip7702 {
                chain_id: signed_chain,
                nonce: tx.nonce,
                gas_limit,
                max_fee_per_gas: required(tx.max_fee_per_gas, "maxFeePerGas")?,
                max_priority_fee_per_gas: required(
                    tx.max_priority_fee_per_gas,
                    "maxPriorityFeePerGas"
                )?,
                to: call_target(tx)?,
                value,
                access_list,
                authorization_list: tx.authorization_list.clone().unwrap_or_default(),
                input,
            },
            signature
        ),
        other => return Err(SignerError::UnsupportedType(other)),
    };
    verify(signature, signing_hash, computed, reported)
}

fn verify(
    signature: Signature,
    signing_hash: B256,
    computed: B256,
    reported: B256,
) -> Result<Address, SignerError> {
    if computed != reported {
        return Err(SignerError::HashMismatch { reported, computed });
    }
    signature
        .recover_address_from_prehash(&signing_hash)
        .map_err(|e| SignerError::BadSignature(e.to_string()))
}

/// `(chain id, odd y)` encoded in a legacy `v`.
fn legacy_parity(v: u64) -> Result<(Option<u64>, bool), SignerError> {
    match v {
        27 | 28 => Ok((None, v == 28)),
        v if v >= EIP155_V_OFFSET => {
            let offset = v - EIP155_V_OFFSET;
            Ok((Some(offset / 2), offset % 2 == 1))
        }
        _ => Err(invalid("v", v)),
    }
}

fn y_parity(tx: &ChainTransaction) -> Result<bool, SignerError> {
    match tx.y_parity.or(tx.v) {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        Some(other) => Err(invalid("yParity", other)),
        None => Err(SignerError::Unsigned),
    }
}

fn ensure_chain(signed: u64, expected: u64) -> Result<(), SignerError> {
    if signed != expected {
        return Err(SignerError::ChainMismatch { signed, expected });
    }
    Ok(())
}

fn tx_kind(tx: &ChainTransaction) -> Result<TxKind, SignerError> {
    match tx.to.as_deref() {
        None => Ok(TxKind::Create),
        Some(to) => Ok(TxKind::Call(parse_address(to)?)),
    }
}

fn call_target(tx: &ChainTransaction) -> Result<Address, SignerError> {
    parse_address(tx.to.as_deref().ok_or(SignerError::MissingField("to"))?)
}

fn parse_address(raw: &str) -> Result<Address, SignerError> {
    Address::from_str(raw).map_err(|_| invalid("address", raw))
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, SignerError> {
    value.ok_or(SignerError::MissingField(field))
}

fn invalid(field: &'static str, value: impl ToString) -> SignerError {
    SignerError::Invalid {
        field,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_v_values() {
        assert_eq!(legacy_parity(27), Ok((None, false)));
        assert_eq!(legacy_parity(28), Ok((None, true)));
        assert_eq!(legacy_parity(37), Ok((Some(1), false)));
        assert_eq!(legacy_parity(38), Ok((Some(1), true)));
        assert_eq!(legacy_parity(310), Ok((Some(137), true)));
        assert!(legacy_parity(1).is_err());
    }

    #[test]
    fn typed_parity_prefers_y_parity() {
        let tx = ChainTransaction {
            v: Some(0),
            y_parity: Some(1),
            ..Default::default()
        };
        assert_eq!(y_parity(&tx), Ok(true));
        let tx = ChainTransaction {
            v: Some(2),
            ..Default::default()
        };
        assert!(y_parity(&tx).is_err());
    }

    #[test]
    fn unsigned_is_rejected_before_anything_else() {
        let tx = ChainTransaction {
            hash: "not a hash".into(),
            from: Some("0x000000000000000000000000000000000000dEaD".into()),
            ..Default::default()
        };
        assert_eq!(recover_signer(&tx, 1), Err(SignerError::Unsigned));
    }

    #[test]
    fn typed_transaction_needs_chain_id() {
        let tx = ChainTransaction {
            hash: format!("{}", B256::ZERO),
            tx_type: Some(2),
            r: Some(alloy_primitives::U256::from(1)),
            s: Some(alloy_primitives::U256::from(1)),
            y_parity: Some(0),
            ..Default::default()
        };
        assert_eq!(
            recover_signer(&tx, 1),
            Err(SignerError::MissingField("chainId"))
        );
    }
}

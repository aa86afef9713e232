use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_consensus::{SignableTransaction, TxEip1559, TxLegacy};
use alloy_primitives::{keccak256, Address, Bytes, Signature, TxKind, B256, U256};
use async_trait::async_trait;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{SigningKey, VerifyingKey};
use serde_json::{json, Value};

use chainsync_core::{BlockNumber, ChainClient, ChainTransaction, SyncError};
use chainsync_rpc::request::IdGenerator;
use chainsync_rpc::{
    ConnectionPool, Dial, EvmChainClient, JsonRpcRequest, JsonRpcResponse, RpcTransport,
    TransportError,
};

/// Canned responses keyed by method name, shared by every dialed connection.
#[derive(Default)]
struct Node {
    responses: Mutex<HashMap<String, Value>>,
    failures: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl Node {
    fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), value);
    }
}

struct MockTransport {
    node: Arc<Node>,
    ids: IdGenerator,
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.node.calls.lock().unwrap().push(req.method.clone());
        if self
            .node
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Http("connection reset".into()));
        }
        let value = self
            .node
            .responses
            .lock()
            .unwrap()
            .get(&req.method)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(JsonRpcResponse::success(1, value))
    }

    fn url(&self) -> &str {
        "mock://node"
    }

    fn next_id(&self) -> u64 {
        self.ids.next()
    }
}

struct MockDialer {
    node: Arc<Node>,
    dials: Arc<AtomicUsize>,
}

#[async_trait]
impl Dial for MockDialer {
    type Conn = MockTransport;

    async fn dial(&self) -> Result<MockTransport, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport {
            node: self.node.clone(),
            ids: IdGenerator::default(),
        })
    }
}

async fn client(
    node: &Arc<Node>,
    chain_id: Option<u64>,
) -> (EvmChainClient<MockDialer>, Arc<AtomicUsize>) {
    let dials = Arc::new(AtomicUsize::new(0));
    let dialer = MockDialer {
        node: node.clone(),
        dials: dials.clone(),
    };
    let pool = ConnectionPool::new(dialer, 1, Duration::from_secs(1));
    let client = EvmChainClient::connect(pool, chain_id).await.unwrap();
    (client, dials)
}

/// EIP-155 example: nonce 9, 20 gwei, 1 ether to 0x3535..35, signed for chain 1.
const EIP155_SENDER: &str = "0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F";

fn eip155_example() -> Value {
    json!({
        "hash": "0x33469b22e9f636356c4160a87eb19df52b7412e8eac32a4a55ffe88ea8350788",
        "type": "0x0",
        "nonce": "0x9",
        "gasPrice": "0x4a817c800",
        "gas": "0x5208",
        "to": "0x3535353535353535353535353535353535353535",
        "value": "0xde0b6b3a7640000",
        "input": "0x",
        "chainId": "0x1",
        "v": "0x25",
        "r": "0x28ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276",
        "s": "0x67cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
    })
}

/// `raw` with the fields of `patch` overwritten.
fn transaction(mut raw: Value, patch: Value) -> ChainTransaction {
    if let (Some(fields), Some(patch)) = (raw.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(raw).unwrap()
}

fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x46; 32]).unwrap()
}

fn address_of(key: &SigningKey) -> Address {
    let point = VerifyingKey::from(key).to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

fn sign(key: &SigningKey, hash: B256) -> Signature {
    let (sig, recovery_id): (k256::ecdsa::Signature, k256::ecdsa::RecoveryId) =
        key.sign_prehash(hash.as_ref()).unwrap();
    let r = U256::from_be_slice(&sig.r().to_bytes());
    let s = U256::from_be_slice(&sig.s().to_bytes());
    Signature::new(r, s, recovery_id.is_y_odd())
}

fn eip1559() -> TxEip1559 {
    TxEip1559 {
        chain_id: 1,
        nonce: 3,
        gas_limit: 21_000,
        max_fee_per_gas: 30_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        to: TxKind::Call(Address::repeat_byte(0x35)),
        value: U256::from(1u64),
        input: Bytes::from_static(&[0xde, 0xad]),
        ..Default::default()
    }
}

/// Node view of `tx` carrying `signature`.
fn eip1559_json(tx: &TxEip1559, signature: Signature) -> Value {
    let hash = *tx.clone().into_signed(signature).hash();
    let parity = if signature.v() { "0x1" } else { "0x0" };
    json!({
        "hash": format!("{hash}"),
        "type": "0x2",
        "nonce": format!("{:#x}", tx.nonce),
        "gas": format!("{:#x}", tx.gas_limit),
        "maxFeePerGas": format!("{:#x}", tx.max_fee_per_gas),
        "maxPriorityFeePerGas": format!("{:#x}", tx.max_priority_fee_per_gas),
        "to": "0x3535353535353535353535353535353535353535",
        "value": "0x1",
        "input": "0xdead",
        "accessList": [],
        "chainId": "0x1",
        "v": parity,
        "yParity": parity,
        "r": format!("0x{:x}", signature.r()),
        "s": format!("0x{:x}", signature.s()),
    })
}

#[tokio::test]
async fn learns_chain_id_from_node() {
    let node = Arc::new(Node::default());
    node.respond("eth_chainId", json!("0x89"));
    let (client, _) = client(&node, None).await;
    assert_eq!(client.chain_id(), 137);
}

#[tokio::test]
async fn configured_chain_id_skips_lookup() {
    let node = Arc::new(Node::default());
    let (client, dials) = client(&node, Some(5)).await;
    assert_eq!(client.chain_id(), 5);
    assert_eq!(dials.load(Ordering::SeqCst), 0);
    assert!(node.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reads_height_and_blocks() {
    let node = Arc::new(Node::default());
    node.respond("eth_blockNumber", json!("0x3e8"));
    node.respond(
        "eth_getBlockByNumber",
        json!({
            "number": "0x3e8",
            "hash": "0xbeef",
            "parentHash": "0xdead",
            "timestamp": "0x10",
            "transactions": []
        }),
    );
    let (client, _) = client(&node, Some(1)).await;

    assert_eq!(client.current_height().await.unwrap(), BlockNumber::from(1000));
    let block = client.block_by_number(BlockNumber::from(1000)).await.unwrap();
    assert_eq!(block.hash, "0xbeef");
    assert_eq!(block.timestamp, 16);
}

#[tokio::test]
async fn missing_block_is_not_found() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;
    let err = client
        .block_by_number(BlockNumber::from(99))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    let err = client.receipt("0xabc").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn connection_error_evicts_and_redials() {
    let node = Arc::new(Node::default());
    node.respond("eth_blockNumber", json!("0x1"));
    let (client, dials) = client(&node, Some(1)).await;

    node.failures.store(1, Ordering::SeqCst);
    assert!(matches!(
        client.current_height().await,
        Err(SyncError::Rpc(_))
    ));
    assert_eq!(client.pool().len(), 0);

    assert_eq!(client.current_height().await.unwrap(), BlockNumber::from(1));
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sender_is_recovered_from_signature() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;

    let sender = client
        .recover_sender(&transaction(eip155_example(), json!({})))
        .unwrap();
    assert_eq!(sender, EIP155_SENDER);

    let claimed = json!({ "from": "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f" });
    let sender = client
        .recover_sender(&transaction(eip155_example(), claimed))
        .unwrap();
    assert_eq!(sender, EIP155_SENDER);
}

#[tokio::test]
async fn unsigned_transaction_is_rejected() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;
    let unsigned: ChainTransaction = serde_json::from_value(json!({
        "hash": "0x33469b22e9f636356c4160a87eb19df52b7412e8eac32a4a55ffe88ea8350788",
        "from": "0x000000000000000000000000000000000000dEaD",
        "nonce": "0x1",
        "value": "0x0",
    }))
    .unwrap();

    let err = client.recover_sender(&unsigned).unwrap_err();
    assert!(matches!(err, SyncError::Recovery { .. }), "{err}");
}

#[tokio::test]
async fn claimed_sender_must_match_signature() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;
    let forged = transaction(
        eip155_example(),
        json!({ "from": "0x000000000000000000000000000000000000dEaD" }),
    );

    let err = client.recover_sender(&forged).unwrap_err();
    assert!(matches!(err, SyncError::Recovery { .. }));
    assert!(err.to_string().contains(EIP155_SENDER), "{err}");
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;

    // s altered in its last byte: the payload no longer hashes to the reported hash
    let tampered = transaction(
        eip155_example(),
        json!({ "s": "0x67cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d84" }),
    );
    assert!(client.recover_sender(&tampered).is_err());

    // a self-consistent hash over a flipped parity recovers someone else
    let key = signing_key();
    let tx = eip1559();
    let genuine = sign(&key, tx.signature_hash());
    let flipped = Signature::new(genuine.r(), genuine.s(), !genuine.v());
    let mut raw = eip1559_json(&tx, flipped);
    raw["from"] = json!(address_of(&key).to_checksum(None));
    let err = client
        .recover_sender(&serde_json::from_value(raw).unwrap())
        .unwrap_err();
    assert!(matches!(err, SyncError::Recovery { .. }));
}

#[tokio::test]
async fn typed_transaction_sender() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;
    let key = signing_key();
    let tx = eip1559();
    let signature = sign(&key, tx.signature_hash());

    let mut raw = eip1559_json(&tx, signature);
    let sender = client
        .recover_sender(&serde_json::from_value(raw.clone()).unwrap())
        .unwrap();
    assert_eq!(sender, address_of(&key).to_checksum(None));

    // any change to the signed fields breaks the hash
    raw["nonce"] = json!("0x4");
    assert!(client
        .recover_sender(&serde_json::from_value(raw).unwrap())
        .is_err());
}

#[tokio::test]
async fn signature_for_another_chain_is_rejected() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(5)).await;
    let err = client
        .recover_sender(&transaction(eip155_example(), json!({})))
        .unwrap_err();
    assert!(err.to_string().contains("chain 1"), "{err}");
}

#[tokio::test]
async fn unprotected_legacy_transaction_is_chain_agnostic() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(5)).await;
    let key = signing_key();
    let tx = TxLegacy {
        chain_id: None,
        nonce: 0,
        gas_price: 1_000_000_000,
        gas_limit: 21_000,
        to: TxKind::Create,
        value: U256::ZERO,
        input: Bytes::from_static(&[0x60, 0x00]),
    };
    let signature = sign(&key, tx.signature_hash());
    let hash = *tx.into_signed(signature).hash();

    let raw = json!({
        "hash": format!("{hash}"),
        "type": "0x0",
        "nonce": "0x0",
        "gasPrice": "0x3b9aca00",
        "gas": "0x5208",
        "to": null,
        "value": "0x0",
        "input": "0x6000",
        "v": if signature.v() { "0x1c" } else { "0x1b" },
        "r": format!("0x{:x}", signature.r()),
        "s": format!("0x{:x}", signature.s()),
    });
    let sender = client
        .recover_sender(&serde_json::from_value(raw).unwrap())
        .unwrap();
    assert_eq!(sender, address_of(&key).to_checksum(None));
}

#[tokio::test]
async fn close_rejects_further_calls() {
    let node = Arc::new(Node::default());
    let (client, _) = client(&node, Some(1)).await;
    client.close().await;
    client.close().await;
    assert!(matches!(
        client.current_height().await,
        Err(SyncError::Closed(_))
    ));
}

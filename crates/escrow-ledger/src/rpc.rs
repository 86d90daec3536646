use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escrow_core::{
    AccountId, ArbiterFeeType, ArbiterPanel, AssetType, Deal, DealId, DealMessage, DealRecord,
    DealTerms, FundingRoute, LedgerClient, LedgerError, LogAppender, LogEnvelope, Reputation,
    Role, TxReceipt, VotingStatus,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

const METHOD_NOT_FOUND: i64 = -32601;
const SUCCESS: &str = "SUCCESS";

/// Ledger client speaking JSON-RPC 2.0 to the escrow contract gateway.
///
/// Responses are decoded against fixed schemas; anything that does not match
/// is a [`LedgerError::Decode`], never a guess.
pub struct JsonRpcLedger {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WriteResult {
    status: String,
    transaction_id: String,
    consensus_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubmitMessageResult {
    status: String,
    sequence_number: u64,
    consensus_timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDealParams<'a> {
    deal_id: &'a DealId,
    signer: &'a AccountId,
    seller: &'a AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    arbiter: Option<&'a AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arbiters: Option<&'a [AccountId]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required_votes: Option<u32>,
    amount: u64,
    asset_type: AssetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset_serial_number: Option<i64>,
    arbiter_fee_type: ArbiterFeeType,
    arbiter_fee_amount: Decimal,
}

impl<'a> CreateDealParams<'a> {
    fn new(terms: &'a DealTerms, signer: &'a AccountId) -> Self {
        let (arbiter, arbiters, required_votes) = match terms.panel() {
            ArbiterPanel::Single(arbiter) => (Some(arbiter), None, None),
            ArbiterPanel::Multi {
                arbiters,
                required_votes,
            } => (None, Some(arbiters.as_slice()), Some(*required_votes)),
        };

        Self {
            deal_id: terms.deal_id(),
            signer,
            seller: terms.seller(),
            arbiter,
            arbiters,
            required_votes,
            amount: terms.amount(),
            asset_type: terms.asset().asset_type(),
            asset_id: terms.asset().token_id(),
            asset_serial_number: terms.asset().serial_number(),
            arbiter_fee_type: terms.fee().fee_type(),
            arbiter_fee_amount: terms.fee().amount(),
        }
    }
}

impl JsonRpcLedger {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "ledger rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Transport(format!("ledger gateway returned {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::rejected(format!("HTTP_{}", status.as_u16())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(err))?;
        decode_response(method, &body)
    }

    async fn write(&self, method: &str, params: Value) -> Result<TxReceipt, LedgerError> {
        let result: WriteResult = self.call(method, params).await?;
        into_receipt(result)
    }

    fn transport_error(&self, err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout(self.timeout)
        } else if err.is_decode() {
            LedgerError::Decode(err.to_string())
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: &[u8]) -> Result<T, LedgerError> {
    let envelope: RpcResponse = serde_json::from_slice(body)
        .map_err(|err| LedgerError::Decode(format!("{method}: {err}")))?;

    match envelope.error {
        Some(error) if error.code == METHOD_NOT_FOUND => {
            Err(LedgerError::Unsupported("this ledger method"))
        }
        Some(error) => Err(LedgerError::rejected(error.message)),
        // An absent result decodes as null, which only optional results accept.
        None => serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|err| LedgerError::Decode(format!("{method}: {err}"))),
    }
}

fn into_receipt(result: WriteResult) -> Result<TxReceipt, LedgerError> {
    if result.status != SUCCESS {
        return Err(LedgerError::rejected(result.status));
    }
    Ok(TxReceipt {
        transaction_id: result.transaction_id,
        status: result.status,
        consensus_at: result.consensus_timestamp,
    })
}

fn decode_deal(record: Option<DealRecord>) -> Result<Option<Deal>, LedgerError> {
    record
        .map(|record| Deal::try_from(record).map_err(|err| LedgerError::Decode(err.to_string())))
        .transpose()
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn create_deal(
        &self,
        terms: &DealTerms,
        signer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        let params = serde_json::to_value(CreateDealParams::new(terms, signer))
            .map_err(|err| LedgerError::Decode(err.to_string()))?;
        self.write("escrow_createDeal", params).await
    }

    async fn accept_as_seller(
        &self,
        deal_id: &DealId,
        seller: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_acceptAsSeller",
            json!({ "dealId": deal_id, "signer": seller }),
        )
        .await
    }

    async fn accept_as_arbiter(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_acceptAsArbiter",
            json!({ "dealId": deal_id, "signer": arbiter }),
        )
        .await
    }

    async fn fund_deal(
        &self,
        deal_id: &DealId,
        route: &FundingRoute,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        let method = match route {
            FundingRoute::Native { .. } => "escrow_fundDeal",
            FundingRoute::FungibleToken { .. } => "escrow_fundDealWithToken",
            FundingRoute::Nft { .. } => "escrow_fundDealWithNft",
        };
        self.write(
            method,
            json!({ "dealId": deal_id, "signer": buyer, "funding": route }),
        )
        .await
    }

    async fn release_funds(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_releaseFunds",
            json!({ "dealId": deal_id, "signer": buyer }),
        )
        .await
    }

    async fn dispute(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write("escrow_dispute", json!({ "dealId": deal_id, "signer": buyer }))
            .await
    }

    async fn submit_evidence(
        &self,
        deal_id: &DealId,
        evidence_hash: &str,
        submitter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_submitEvidence",
            json!({ "dealId": deal_id, "signer": submitter, "evidenceHash": evidence_hash }),
        )
        .await
    }

    async fn vote_on_dispute(
        &self,
        deal_id: &DealId,
        release_to_seller: bool,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_voteOnDispute",
            json!({ "dealId": deal_id, "signer": arbiter, "releaseToSeller": release_to_seller }),
        )
        .await
    }

    async fn refund_buyer(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "escrow_refundBuyer",
            json!({ "dealId": deal_id, "signer": arbiter }),
        )
        .await
    }

    async fn get_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, LedgerError> {
        let record: Option<DealRecord> = self
            .call("escrow_getDeal", json!({ "dealId": deal_id }))
            .await?;
        decode_deal(record)
    }

    async fn list_deal_ids(&self) -> Result<Vec<DealId>, LedgerError> {
        self.call("escrow_listDealIds", json!({})).await
    }

    async fn get_voting_status(
        &self,
        deal_id: &DealId,
    ) -> Result<Option<VotingStatus>, LedgerError> {
        self.call("escrow_getVotingStatus", json!({ "dealId": deal_id }))
            .await
    }

    async fn get_reputation(
        &self,
        account: &AccountId,
        role: Role,
    ) -> Result<Reputation, LedgerError> {
        self.call(
            "escrow_getReputation",
            json!({ "accountId": account, "role": role }),
        )
        .await
    }
}

/// Submits deal messages to a consensus topic through the same gateway the
/// ledger client talks to.
#[derive(Clone)]
pub struct JsonRpcTopicWriter {
    ledger: Arc<JsonRpcLedger>,
    topic_id: String,
}

impl JsonRpcTopicWriter {
    pub fn new(ledger: Arc<JsonRpcLedger>, topic_id: &str) -> Self {
        Self {
            ledger,
            topic_id: topic_id.trim().to_string(),
        }
    }
}

#[async_trait]
impl LogAppender for JsonRpcTopicWriter {
    async fn append(&self, message: &DealMessage) -> anyhow::Result<LogEnvelope> {
        let payload = serde_json::to_string(message).context("failed to encode deal message")?;
        let result: SubmitMessageResult = self
            .ledger
            .call(
                "consensus_submitMessage",
                json!({ "topicId": self.topic_id, "message": payload }),
            )
            .await
            .with_context(|| format!("failed to submit to topic {}", self.topic_id))?;
        into_envelope(result, payload).map_err(anyhow::Error::from)
    }
}

fn into_envelope(result: SubmitMessageResult, payload: String) -> Result<LogEnvelope, LedgerError> {
    if result.status != SUCCESS {
        return Err(LedgerError::rejected(result.status));
    }
    Ok(LogEnvelope {
        sequence: result.sequence_number,
        consensus_timestamp: result.consensus_timestamp,
        payload,
    })
}

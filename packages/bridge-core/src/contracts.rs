//! Smart-contract-layer ABI bindings
//!
//! Uses alloy's sol! macro for the token backing contract (registration and
//! proof-carrying unlocks) and the ERC20 approval that precedes a transfer.

#![allow(clippy::too_many_arguments)]

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{ProviderBuilder, RootProvider};
use alloy::sol;
use alloy::sol_types::SolCall;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info};

use crate::client::ChainCall;
use crate::error::ProofError;
use crate::proof::ProofBundle;
use crate::registration::{RegistrationStatus, TokenRegistry};

sol! {
    /// Token backing contract on the smart-contract layer
    #[sol(rpc)]
    contract TokenBacking {
        /// Start permissionless registration of an ERC20 token
        function registerToken(address token) external payable;

        /// 0 = unregistered, 1 = registering, 2 = registered
        function registrationStatus(address token) external view returns (uint8 status);

        /// Finish registration with a proof of the source-chain registration record
        function confirmRegistration(
            bytes32 root,
            uint32 mmrIndex,
            bytes blockHeader,
            bytes32[] peaks,
            bytes32[] siblings,
            bytes storageProof,
            bytes rootMessage,
            bytes[] signatures
        ) external;

        /// Release tokens locked on the remote chain
        function unlockFromRemote(
            bytes32 root,
            uint32 mmrIndex,
            bytes blockHeader,
            bytes32[] peaks,
            bytes32[] siblings,
            bytes storageProof,
            bytes rootMessage,
            bytes[] signatures
        ) external;
    }
}

sol! {
    contract Erc20 {
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// Proof arguments shared by `confirmRegistration` and `unlockFromRemote`
struct ProofArgs {
    root: B256,
    mmr_index: u32,
    header: Bytes,
    peaks: Vec<B256>,
    siblings: Vec<B256>,
    storage_proof: Bytes,
    root_message: Bytes,
    signatures: Vec<Bytes>,
}

impl TryFrom<&ProofBundle> for ProofArgs {
    type Error = ProofError;

    fn try_from(bundle: &ProofBundle) -> Result<Self, Self::Error> {
        let mmr_index =
            u32::try_from(bundle.mmr_index).map_err(|_| ProofError::IndexOverflow(bundle.mmr_index))?;
        Ok(Self {
            root: bundle.root,
            mmr_index,
            header: bundle.header.encoded.clone(),
            peaks: bundle.mmr_proof.peaks.clone(),
            siblings: bundle.mmr_proof.siblings.clone(),
            storage_proof: bundle.storage_proof.clone(),
            root_message: bundle.root_message.clone().unwrap_or_default(),
            signatures: bundle.signatures.clone().unwrap_or_default(),
        })
    }
}

pub fn register_token_call(backing: Address, token: Address) -> ChainCall {
    ChainCall::contract(backing, TokenBacking::registerTokenCall { token }.abi_encode())
}

pub fn confirm_registration_call(
    backing: Address,
    bundle: &ProofBundle,
) -> Result<ChainCall, ProofError> {
    let args = ProofArgs::try_from(bundle)?;
    let data = TokenBacking::confirmRegistrationCall {
        root: args.root,
        mmrIndex: args.mmr_index,
        blockHeader: args.header,
        peaks: args.peaks,
        siblings: args.siblings,
        storageProof: args.storage_proof,
        rootMessage: args.root_message,
        signatures: args.signatures,
    }
    .abi_encode();
    Ok(ChainCall::contract(backing, data))
}

pub fn unlock_from_remote_call(
    backing: Address,
    bundle: &ProofBundle,
) -> Result<ChainCall, ProofError> {
    let args = ProofArgs::try_from(bundle)?;
    let data = TokenBacking::unlockFromRemoteCall {
        root: args.root,
        mmrIndex: args.mmr_index,
        blockHeader: args.header,
        peaks: args.peaks,
        siblings: args.siblings,
        storageProof: args.storage_proof,
        rootMessage: args.root_message,
        signatures: args.signatures,
    }
    .abi_encode();
    Ok(ChainCall::contract(backing, data))
}

pub fn approve_call(token: Address, spender: Address, amount: U256) -> ChainCall {
    ChainCall::contract(token, Erc20::approveCall { spender, amount }.abi_encode())
}

/// [`TokenRegistry`] backed by `registrationStatus` on an EVM backing contract
pub struct EvmTokenRegistry {
    provider: RootProvider<Http<Client>>,
    backing: Address,
}

impl EvmTokenRegistry {
    pub fn new(rpc_url: &str, backing: Address) -> Result<Self> {
        let provider = ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("Invalid RPC URL")?);
        info!(rpc_url = %rpc_url, backing = %backing, "Created token registry client");
        Ok(Self { provider, backing })
    }
}

#[async_trait]
impl TokenRegistry for EvmTokenRegistry {
    async fn registration_status(&self, token: Address) -> Result<RegistrationStatus> {
        let contract = TokenBacking::new(self.backing, &self.provider);
        let result = contract
            .registrationStatus(token)
            .call()
            .await
            .map_err(|e| eyre!("Failed to query registration status: {}", e))?;

        debug!(token = %token, status = result.status, "Queried registration status");
        RegistrationStatus::try_from(result.status)
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy_dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy_eips::BlockId;
use alloy_json_abi::{Function, JsonAbi};
use alloy_primitives::{Address, Bytes};
use alloy_provider::Provider;
use alloy_rpc_types_eth::TransactionRequest;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::models::contract::Contract;
use crate::models::errors::PollerError;
use crate::models::logs::MethodResult;
use crate::storage::MethodRepository;
use crate::utils::render_value;

#[async_trait]
pub trait Poller: Send + Sync {
    /// Calls a constant method. `block` of `None` reads the latest state.
    async fn fetch_contract_data(
        &self,
        abi: &JsonAbi,
        address: Address,
        method: &str,
        args: &[DynSolValue],
        block: Option<u64>,
    ) -> Result<Vec<DynSolValue>, PollerError>;

    /// Polls every selected method of `contract` up to and including `block`.
    async fn poll_contract(&mut self, contract: &Contract, block: u64) -> Result<(), PollerError>;
}

/// Polls contract methods over `eth_call` and stores the results.
pub struct MethodPoller<P> {
    provider: P,
    repository: Arc<dyn MethodRepository>,
    max_blocks_per_cycle: u64,
    polled_through: HashMap<Address, u64>,
}

impl<P: Provider> MethodPoller<P> {
    pub fn new(provider: P, repository: Arc<dyn MethodRepository>) -> Self {
        Self {
            provider,
            repository,
            max_blocks_per_cycle: u64::MAX,
            polled_through: HashMap::new(),
        }
    }

    /// Bounds how many blocks a single `poll_contract` call walks.
    pub fn with_max_blocks_per_cycle(mut self, max_blocks: u64) -> Self {
        self.max_blocks_per_cycle = max_blocks.max(1);
        self
    }

    async fn call(
        &self,
        function: &Function,
        address: Address,
        args: &[DynSolValue],
        block: Option<u64>,
    ) -> Result<Vec<DynSolValue>, PollerError> {
        let abi_error = |source| PollerError::Abi {
            method: function.name.clone(),
            source,
        };
        let input = function.abi_encode_input(args).map_err(abi_error)?;
        let tx = TransactionRequest::default()
            .to(address)
            .input(Bytes::from(input).into());
        let block_id = block.map_or(BlockId::latest(), BlockId::number);

        let output = self
            .provider
            .call(tx)
            .block(block_id)
            .await
            .map_err(|source| PollerError::Call {
                address,
                method: function.name.clone(),
                source,
            })?;
        function.abi_decode_output(&output).map_err(abi_error)
    }

    async fn poll_contract_at(&self, contract: &Contract, block: u64) -> Result<usize, PollerError> {
        let mut candidates = candidate_addrs(contract);
        let mut calls = 0;

        for function in &contract.methods {
            let arg_sets: Vec<Vec<Address>> = match function.inputs.len() {
                0 => vec![vec![]],
                1 => candidates.iter().map(|a| vec![*a]).collect(),
                2 => candidates
                    .iter()
                    .flat_map(|a| candidates.iter().map(move |b| vec![*a, *b]))
                    .collect(),
                _ => {
                    return Err(PollerError::UnsupportedMethod {
                        method: function.signature(),
                    });
                }
            };

            let mut piped = Vec::new();
            for args in arg_sets {
                let values: Vec<DynSolValue> =
                    args.iter().map(|a| DynSolValue::Address(*a)).collect();
                let output = self
                    .call(function, contract.address, &values, Some(block))
                    .await?;
                calls += 1;

                if contract.piping {
                    piped.extend(output.iter().filter_map(DynSolValue::as_address));
                }

                let arguments: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                let result = MethodResult {
                    id: MethodResult::record_id(&contract.address, &function.name, &arguments, block),
                    contract_address: contract.address,
                    contract_name: contract.name.clone(),
                    method: function.name.clone(),
                    arguments,
                    block_number: block,
                    output: output.iter().map(render_value).collect(),
                };
                self.repository
                    .persist_results(&[result])
                    .await
                    .map_err(|source| PollerError::Persist {
                        method: function.name.clone(),
                        source,
                    })?;
            }

            // Address outputs feed the argument set of the methods that follow
            for addr in piped {
                if !addr.is_zero() && contract.wanted_method_arg(&addr.to_string()) {
                    candidates.insert(addr);
                }
            }
        }
        Ok(calls)
    }
}

// Emitted holder addresses plus any addresses given explicitly as method args
fn candidate_addrs(contract: &Contract) -> BTreeSet<Address> {
    let mut candidates: BTreeSet<Address> = contract
        .emitted_addrs
        .iter()
        .flatten()
        .copied()
        .collect();
    candidates.extend(
        contract
            .method_args
            .iter()
            .filter_map(|arg| arg.parse::<Address>().ok()),
    );
    candidates
}

#[async_trait]
impl<P: Provider + 'static> Poller for MethodPoller<P> {
    async fn fetch_contract_data(
        &self,
        abi: &JsonAbi,
        address: Address,
        method: &str,
        args: &[DynSolValue],
        block: Option<u64>,
    ) -> Result<Vec<DynSolValue>, PollerError> {
        let function = abi
            .function(method)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == args.len()))
            .ok_or_else(|| PollerError::MethodNotFound {
                method: method.to_string(),
                args: args.len(),
            })?;
        self.call(function, address, args, block).await
    }

    async fn poll_contract(&mut self, contract: &Contract, block: u64) -> Result<(), PollerError> {
        if contract.methods.is_empty() {
            return Ok(());
        }

        let start = self
            .polled_through
            .get(&contract.address)
            .map_or(contract.starting_block, |last| last + 1);
        if start > block {
            debug!("Methods of {} already polled through block {}", contract.address, block);
            return Ok(());
        }
        let end = block.min(start.saturating_add(self.max_blocks_per_cycle - 1));
        if end < block {
            warn!(
                "Polling {} for blocks {}..={} only, {} blocks remain for later cycles",
                contract.address,
                start,
                end,
                block - end
            );
        }

        let mut calls = 0;
        for height in start..=end {
            calls += self.poll_contract_at(contract, height).await?;
            self.polled_through.insert(contract.address, height);
        }

        info!(
            "Polled {} method(s) of {} for blocks {}..={} ({} calls)",
            contract.methods.len(),
            contract.address,
            start,
            end,
            calls
        );
        Ok(())
    }
}

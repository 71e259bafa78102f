//! Contract ABI resolution.
//!
//! ABIs come either from the config file or from a block explorer lookup by
//! address. Both paths produce a [`ContractAbi`], which keeps the raw JSON next
//! to the parsed form and answers the event and method selection questions the
//! transformer asks while building a contract.

use std::collections::HashMap;

use alloy_json_abi::{Event, Function, JsonAbi};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::common::AbiLookupConfig;
use crate::models::errors::ParserError;

/// Parsed ABI plus the JSON it came from.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    pub raw: String,
    pub parsed: JsonAbi,
}

impl ContractAbi {
    pub fn from_json(raw: &str) -> Result<Self, ParserError> {
        let parsed: JsonAbi = serde_json::from_str(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            parsed,
        })
    }

    /// Events keyed by signature. An empty `wanted` list selects every event.
    /// Anonymous events are never selected.
    pub fn events(&self, wanted: &[String]) -> HashMap<String, Event> {
        for name in wanted {
            if self.parsed.event(name).is_none() {
                warn!("Event '{}' not found in ABI, skipping", name);
            }
        }
        self.parsed
            .events()
            .filter(|event| wanted.is_empty() || wanted.contains(&event.name))
            .filter(|event| {
                if event.anonymous {
                    warn!(
                        "Event '{}' is anonymous and has no topic to filter on, skipping",
                        event.signature()
                    );
                }
                !event.anonymous
            })
            .map(|event| (event.signature(), event.clone()))
            .collect()
    }

    /// Wanted methods the poller can call: up to two `address` inputs and at
    /// least one output. An empty `wanted` list selects nothing.
    pub fn select_methods(&self, wanted: &[String]) -> Vec<Function> {
        let mut methods = Vec::new();
        for name in wanted {
            let Some(candidates) = self.parsed.function(name) else {
                warn!("Method '{}' not found in ABI, skipping", name);
                continue;
            };
            for function in candidates {
                if is_pollable(function) {
                    methods.push(function.clone());
                } else {
                    warn!(
                        "Method '{}' cannot be polled (only up to two address inputs with outputs are supported)",
                        function.signature()
                    );
                }
            }
        }
        methods
    }
}

fn is_pollable(function: &Function) -> bool {
    function.inputs.len() <= 2
        && function.inputs.iter().all(|input| input.ty == "address")
        && !function.outputs.is_empty()
}

#[async_trait]
pub trait Parser: Send + Sync {
    /// Looks up the ABI of a deployed contract.
    async fn parse(&self, address: Address) -> Result<ContractAbi, ParserError>;

    fn parse_abi_str(&self, abi: &str) -> Result<ContractAbi, ParserError> {
        ContractAbi::from_json(abi)
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: String,
}

/// Resolves ABIs through an Etherscan-compatible explorer API.
pub struct AbiParser {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AbiParser {
    pub fn new(network: &str, lookup: &AbiLookupConfig) -> Self {
        let base_url = lookup
            .url
            .clone()
            .unwrap_or_else(|| explorer_url(network));
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: lookup.api_key.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn explorer_url(network: &str) -> String {
    match network {
        "" | "mainnet" => "https://api.etherscan.io/api".to_string(),
        other => format!("https://api-{}.etherscan.io/api", other),
    }
}

#[async_trait]
impl Parser for AbiParser {
    async fn parse(&self, address: Address) -> Result<ContractAbi, ParserError> {
        debug!("Fetching ABI for {} from {}", address, self.base_url);

        let address_param = address.to_string();
        let mut query = vec![
            ("module", "contract"),
            ("action", "getabi"),
            ("address", address_param.as_str()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.as_str()));
        }

        let request_error = |e: reqwest::Error| ParserError::Request {
            address,
            message: e.to_string(),
        };
        let body = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(request_error)?
            .text()
            .await
            .map_err(request_error)?;

        let response: ExplorerResponse = serde_json::from_str(&body)?;
        if response.status != "1" {
            return Err(ParserError::Lookup {
                address,
                message: format!("{}: {}", response.message, response.result),
            });
        }

        ContractAbi::from_json(&response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contract::tests::ERC20_ABI;

    #[test]
    fn test_all_events_selected_when_none_named() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();
        let events = abi.events(&[]);

        assert_eq!(events.len(), 2);
        assert!(events.contains_key("Transfer(address,address,uint256)"));
        assert!(events.contains_key("Approval(address,address,uint256)"));
    }

    #[test]
    fn test_named_events_only() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();
        let events = abi.events(&["Transfer".to_string(), "Missing".to_string()]);

        assert_eq!(events.len(), 1);
        assert_eq!(events["Transfer(address,address,uint256)"].name, "Transfer");
    }

    #[test]
    fn test_select_methods_filters_unpollable() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();

        assert!(abi.select_methods(&[]).is_empty());

        let methods = abi.select_methods(&[
            "name".to_string(),
            "balanceOf".to_string(),
            "allowance".to_string(),
            "transfer".to_string(),
        ]);
        let names: Vec<&str> = methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["name", "balanceOf", "allowance"]);
    }

    #[test]
    fn test_anonymous_events_are_skipped() {
        let abi = ContractAbi::from_json(
            r#"[
            {"type":"event","name":"Transfer","anonymous":false,"inputs":[
                {"name":"from","type":"address","indexed":true},
                {"name":"to","type":"address","indexed":true},
                {"name":"value","type":"uint256","indexed":false}]},
            {"type":"event","name":"Log","anonymous":true,"inputs":[
                {"name":"sender","type":"address","indexed":true},
                {"name":"data","type":"bytes","indexed":false}]}
        ]"#,
        )
        .unwrap();

        let all = abi.events(&[]);
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("Transfer(address,address,uint256)"));

        assert!(abi.events(&["Log".to_string()]).is_empty());
    }

    #[test]
    fn test_invalid_abi_string() {
        let err = ContractAbi::from_json("not json").unwrap_err();
        assert!(matches!(err, ParserError::InvalidAbi(_)));
    }

    #[test]
    fn test_explorer_url_per_network() {
        let lookup = AbiLookupConfig::default();
        assert_eq!(
            AbiParser::new("", &lookup).base_url(),
            "https://api.etherscan.io/api"
        );
        assert_eq!(
            AbiParser::new("sepolia", &lookup).base_url(),
            "https://api-sepolia.etherscan.io/api"
        );

        let custom = AbiLookupConfig {
            url: Some("http://localhost:9000/api".to_string()),
            api_key: None,
        };
        assert_eq!(
            AbiParser::new("sepolia", &custom).base_url(),
            "http://localhost:9000/api"
        );
    }
}

use std::collections::{HashMap, HashSet};

use alloy_json_abi::{Event, Function, JsonAbi};
use alloy_primitives::{Address, B256};
use serde::Serialize;

use crate::models::errors::ContractError;

/// Durable watch specification for one event of one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub name: String,
    pub from_block: u64,
    pub to_block: Option<u64>, // None follows the chain head
    pub address: Address,
    pub topics: Vec<Option<B256>>,
}

impl Filter {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied().flatten()
    }
}

/// Everything the transformer knows about one watched contract.
#[derive(Debug, Clone)]
pub struct Contract {
    pub name: String,
    pub network: String,
    pub address: Address,
    pub abi: String,
    pub parsed_abi: JsonAbi,
    pub starting_block: u64,
    pub events: HashMap<String, Event>, // Keyed by event signature
    pub methods: Vec<Function>,
    pub filter_args: HashSet<String>,
    pub method_args: HashSet<String>,
    pub piping: bool,
    pub filters: HashMap<String, Filter>, // Keyed by event signature
    // Holder addresses seen in converted logs, only tracked when methods are polled
    pub emitted_addrs: Option<HashSet<Address>>,
}

impl Contract {
    /// Finishes construction: sets up the emitted address cache when any
    /// method is selected for polling.
    pub fn init(mut self) -> Self {
        if !self.methods.is_empty() && self.emitted_addrs.is_none() {
            self.emitted_addrs = Some(HashSet::new());
        }
        self
    }

    pub fn generate_filters(&mut self) -> Result<(), ContractError> {
        if self.events.is_empty() {
            return Err(ContractError::NoEvents {
                address: self.address,
            });
        }

        let address = self.address.to_string().to_lowercase();
        for (signature, event) in &self.events {
            if event.anonymous {
                return Err(ContractError::AnonymousEvent {
                    name: event.name.clone(),
                });
            }
            let filter = Filter {
                name: format!("{}_{}", event.name, address),
                from_block: self.starting_block,
                to_block: None,
                address: self.address,
                topics: vec![Some(event.selector())],
            };
            self.filters.insert(signature.clone(), filter);
        }
        Ok(())
    }

    /// Whether `arg` may be used as a method argument. An empty set allows all.
    pub fn wanted_method_arg(&self, arg: &str) -> bool {
        self.method_args.is_empty()
            || self
                .method_args
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(arg))
    }

    pub fn add_emitted_addrs<I>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = Address>,
    {
        if self.emitted_addrs.is_none() {
            return;
        }
        let wanted: Vec<Address> = addrs
            .into_iter()
            .filter(|addr| !addr.is_zero() && self.wanted_method_arg(&addr.to_string()))
            .collect();
        if let Some(cache) = self.emitted_addrs.as_mut() {
            cache.extend(wanted);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const ERC20_ABI: &str = r#"[
        {"type":"event","name":"Transfer","anonymous":false,"inputs":[
            {"name":"from","type":"address","indexed":true},
            {"name":"to","type":"address","indexed":true},
            {"name":"value","type":"uint256","indexed":false}]},
        {"type":"event","name":"Approval","anonymous":false,"inputs":[
            {"name":"owner","type":"address","indexed":true},
            {"name":"spender","type":"address","indexed":true},
            {"name":"value","type":"uint256","indexed":false}]},
        {"type":"function","name":"name","stateMutability":"view","inputs":[],
            "outputs":[{"name":"","type":"string"}]},
        {"type":"function","name":"balanceOf","stateMutability":"view",
            "inputs":[{"name":"owner","type":"address"}],
            "outputs":[{"name":"","type":"uint256"}]},
        {"type":"function","name":"allowance","stateMutability":"view",
            "inputs":[{"name":"owner","type":"address"},{"name":"spender","type":"address"}],
            "outputs":[{"name":"","type":"uint256"}]},
        {"type":"function","name":"transfer","stateMutability":"nonpayable",
            "inputs":[{"name":"to","type":"address"},{"name":"value","type":"uint256"}],
            "outputs":[{"name":"","type":"bool"}]}
    ]"#;

    pub(crate) fn test_contract(event_names: &[&str], method_names: &[&str]) -> Contract {
        let parsed_abi: JsonAbi = serde_json::from_str(ERC20_ABI).unwrap();
        let events = parsed_abi
            .events()
            .filter(|e| event_names.contains(&e.name.as_str()))
            .map(|e| (e.signature(), e.clone()))
            .collect();
        let methods = parsed_abi
            .functions()
            .filter(|f| method_names.contains(&f.name.as_str()))
            .cloned()
            .collect();
        Contract {
            name: "Test Token".to_string(),
            network: String::new(),
            address: Address::repeat_byte(0xab),
            abi: ERC20_ABI.to_string(),
            parsed_abi,
            starting_block: 100,
            events,
            methods,
            filter_args: HashSet::new(),
            method_args: HashSet::new(),
            piping: false,
            filters: HashMap::new(),
            emitted_addrs: None,
        }
        .init()
    }

    #[test]
    fn test_generate_filters_one_per_event() {
        let mut contract = test_contract(&["Transfer", "Approval"], &[]);
        contract.generate_filters().unwrap();

        assert_eq!(contract.filters.len(), 2);
        let transfer = &contract.filters["Transfer(address,address,uint256)"];
        assert_eq!(
            transfer.name,
            format!("Transfer_0x{}", "ab".repeat(20))
        );
        assert_eq!(transfer.from_block, 100);
        assert_eq!(transfer.to_block, None);
        assert_eq!(transfer.address, contract.address);
        assert_eq!(
            transfer.topic0(),
            Some(contract.events["Transfer(address,address,uint256)"].selector())
        );
    }

    #[test]
    fn test_generate_filters_without_events_fails() {
        let mut contract = test_contract(&[], &[]);
        let err = contract.generate_filters().unwrap_err();
        assert!(matches!(err, ContractError::NoEvents { .. }));
        assert!(contract.filters.is_empty());
    }

    #[test]
    fn test_emitted_addrs_only_cached_with_methods() {
        let mut without_methods = test_contract(&["Transfer"], &[]);
        without_methods.add_emitted_addrs([Address::repeat_byte(1)]);
        assert!(without_methods.emitted_addrs.is_none());

        let mut with_methods = test_contract(&["Transfer"], &["balanceOf"]);
        with_methods.add_emitted_addrs([Address::repeat_byte(1), Address::ZERO]);
        let cache = with_methods.emitted_addrs.as_ref().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&Address::repeat_byte(1)));
    }

    #[test]
    fn test_emitted_addrs_respect_method_args() {
        let mut contract = test_contract(&["Transfer"], &["balanceOf"]);
        let wanted = Address::repeat_byte(2);
        contract.method_args.insert(wanted.to_string().to_lowercase());

        contract.add_emitted_addrs([Address::repeat_byte(1), wanted]);

        let cache = contract.emitted_addrs.as_ref().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&wanted));
        assert!(contract.wanted_method_arg(&wanted.to_string()));
        assert!(!contract.wanted_method_arg(&Address::repeat_byte(1).to_string()));
    }
}

pub mod retry;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::hex;
use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use std::path::Path;
use tracing::info;

use crate::models::common::Config;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    info!("Config path: {}", path.to_string_lossy());

    let source = File::from(path).format(FileFormat::Yaml);
    load_config_from(source)
}

// Layers `WATCHER__*` environment variables over the given YAML source
fn load_config_from<S>(source: S) -> Result<Config>
where
    S: config::Source + Send + Sync + 'static,
{
    config::Config::builder()
        .set_default("network", "")?
        .set_default("dataset", "contract_watcher")?
        .set_default("dataset_location", "US")?
        .set_default("poll_interval_ms", 7_000)?
        .set_default("max_blocks_per_cycle", 1_000)?
        .add_source(source)
        .add_source(Environment::with_prefix("WATCHER").separator("__"))
        .build()
        .context("failed to read config file")?
        .try_deserialize()
        .context("failed to parse config YAML")
}

// Renders a decoded ABI value the way it is stored: numbers in decimal,
// addresses checksummed, byte strings as 0x-hex, lists as JSON-like arrays.
pub fn render_value(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::FixedBytes(word, size) => hex::encode_prefixed(&word[..*size]),
        DynSolValue::Address(address) => address.to_string(),
        DynSolValue::Bytes(bytes) => hex::encode_prefixed(bytes),
        DynSolValue::String(s) => s.clone(),
        DynSolValue::Array(values)
        | DynSolValue::FixedArray(values)
        | DynSolValue::Tuple(values) => {
            let rendered: Vec<String> = values.iter().map(render_value).collect();
            format!("[{}]", rendered.join(","))
        }
        other => format!("{other:?}"),
    }
}

fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        // Remove all HTML tags and return the first non-empty line of text
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && !line.starts_with("<!")
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        // Return original error if no HTML
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, I256, U256};

    const CONFIG_YAML: &str = r#"
rpc_url: http://localhost:8545
source_dataset: ethereum
metrics:
  enabled: true
  address: 127.0.0.1
  port: 9200
contracts:
  - address: "0xabababababababababababababababababababab"
    start_block: 100
    events: [Transfer]
    methods: [balanceOf]
  - address: "0xcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd"
    abi: "[]"
    event_args: ["0x1111111111111111111111111111111111111111"]
    piping: true
"#;

    #[test]
    fn test_load_config_applies_defaults() {
        let config = load_config_from(File::from_str(CONFIG_YAML, FileFormat::Yaml)).unwrap();

        assert_eq!(config.network, "");
        assert_eq!(config.dataset, "contract_watcher");
        assert_eq!(config.poll_interval_ms, 7_000);
        assert_eq!(config.max_blocks_per_cycle, 1_000);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9200);
        assert!(config.abi_lookup.api_key.is_none());
        assert_eq!(config.contracts.len(), 2);

        let first = &config.contracts[0];
        assert_eq!(first.address, Address::repeat_byte(0xab));
        assert_eq!(first.start_block, 100);
        assert_eq!(first.events, vec!["Transfer".to_string()]);
        assert!(first.abi.is_empty());

        let second = &config.contracts[1];
        assert!(second.piping);
        assert_eq!(second.start_block, 0);
        assert_eq!(second.event_args.len(), 1);
    }

    #[test]
    fn test_contract_config_keys_by_address() {
        let config = load_config_from(File::from_str(CONFIG_YAML, FileFormat::Yaml)).unwrap();
        let contract_config = config.contract_config();

        assert_eq!(contract_config.contracts.len(), 2);
        assert!(
            contract_config
                .contracts
                .contains_key(&Address::repeat_byte(0xcd))
        );
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&DynSolValue::Uint(U256::from(1000), 256)), "1000");
        assert_eq!(
            render_value(&DynSolValue::Int(I256::try_from(-5i64).unwrap(), 256)),
            "-5"
        );
        assert_eq!(render_value(&DynSolValue::Bool(true)), "true");
        assert_eq!(
            render_value(&DynSolValue::FixedBytes(B256::repeat_byte(0x11), 2)),
            "0x1111"
        );
        assert_eq!(
            render_value(&DynSolValue::Array(vec![
                DynSolValue::Uint(U256::from(1), 8),
                DynSolValue::Uint(U256::from(2), 8),
            ])),
            "[1,2]"
        );
    }

    #[test]
    fn test_strip_html() {
        let html = "<html>\n<body>\n502 Bad Gateway\n</body>\n</html>";
        assert_eq!(strip_html(html), "502 Bad Gateway");
        assert_eq!(strip_html("plain error"), "plain error");
    }
}

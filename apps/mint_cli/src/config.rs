use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use client_core::{RpcConnectorConfig, RpcTimings, RuntimeSettings};
use serde::Deserialize;
use shared::domain::{AccountAddress, ConnectorId, ContractAddress};
use tracing::warn;
use url::Url;
use wallet_integration::MintContract;

pub const DEFAULT_CONFIG_FILE: &str = "mint.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connect_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    pub account_poll_interval_ms: Option<u64>,
    pub contract: ContractSettings,
    pub connectors: Vec<ConnectorSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContractSettings {
    pub address: String,
    pub abi_path: Option<PathBuf>,
    pub mint_calldata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectorSettings {
    pub id: String,
    pub display_name: String,
    pub rpc_url: String,
    #[serde(default)]
    pub account: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            receipt_poll_interval_ms: 1_000,
            receipt_timeout_secs: 120,
            account_poll_interval_ms: None,
            contract: ContractSettings::default(),
            connectors: vec![ConnectorSettings::local("http://127.0.0.1:8545")],
        }
    }
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            address: "0x0000000000000000000000000000000000000000".into(),
            abi_path: None,
            mint_calldata: None,
        }
    }
}

impl ConnectorSettings {
    fn local(rpc_url: &str) -> Self {
        Self {
            id: "local".into(),
            display_name: "Local Node".into(),
            rpc_url: rpc_url.into(),
            account: None,
        }
    }
}

impl Settings {
    pub fn runtime(&self) -> RuntimeSettings {
        RuntimeSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn rpc_timings(&self) -> RpcTimings {
        RpcTimings {
            receipt_poll_interval: Duration::from_millis(self.receipt_poll_interval_ms),
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            account_poll_interval: self.account_poll_interval_ms.map(Duration::from_millis),
        }
    }

    pub fn rpc_connectors(&self) -> Result<Vec<RpcConnectorConfig>> {
        self.connectors
            .iter()
            .map(|connector| {
                let rpc_url = Url::parse(&connector.rpc_url).with_context(|| {
                    format!(
                        "invalid rpc_url '{}' for connector '{}'",
                        connector.rpc_url, connector.id
                    )
                })?;
                Ok(RpcConnectorConfig {
                    id: ConnectorId::new(connector.id.as_str()),
                    display_name: connector.display_name.clone(),
                    rpc_url,
                    account: connector.account.as_deref().map(AccountAddress::new),
                })
            })
            .collect()
    }

    /// Builds the contract binding. The ABI file is read as opaque JSON.
    pub fn mint_contract(&self) -> Result<MintContract> {
        let interface: serde_json::Value = match &self.contract.abi_path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read ABI file '{}'", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("ABI file '{}' is not JSON", path.display()))?
            }
            None => serde_json::Value::Array(Vec::new()),
        };

        let contract = MintContract::new(
            ContractAddress::new(self.contract.address.as_str()),
            interface,
        );
        Ok(match &self.contract.mint_calldata {
            Some(calldata) => contract.with_mint_calldata(calldata.as_str()),
            None => contract,
        })
    }
}

/// Defaults, then the TOML file, then `APP__*` environment variables.
///
/// An explicit `path` must exist; the default `mint.toml` is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_settings_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    parse_settings(&raw).with_context(|| format!("invalid config file '{}'", path.display()))
}

pub fn parse_settings(raw: &str) -> Result<Settings> {
    Ok(toml::from_str(raw)?)
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__RPC_URL") {
        match settings.connectors.first_mut() {
            Some(first) => first.rpc_url = v,
            None => settings.connectors.push(ConnectorSettings::local(&v)),
        }
    }

    if let Some(v) = lookup("APP__CONTRACT_ADDRESS") {
        settings.contract.address = v;
    }

    if let Some(v) = lookup("APP__CONNECT_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.connect_timeout_secs = parsed,
            Err(_) => warn!("config: ignoring APP__CONNECT_TIMEOUT_SECS={v}"),
        }
    }

    if let Some(v) = lookup("APP__RECEIPT_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.receipt_timeout_secs = parsed,
            Err(_) => warn!("config: ignoring APP__RECEIPT_TIMEOUT_SECS={v}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

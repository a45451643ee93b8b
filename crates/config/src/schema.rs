use serde::Deserialize;
use std::collections::BTreeMap;
use swapledger_core_types::SwapSource;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub sqlite: SqliteConfig,
    pub sync: SyncConfig,
    pub http: HttpConfig,
    pub affiliates: AffiliateConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn provider(&self, source: SwapSource) -> &ProviderConfig {
        match source {
            SwapSource::Thorchain => &self.providers.thorchain,
            SwapSource::Mayachain => &self.providers.mayachain,
            SwapSource::Lifi => &self.providers.lifi,
            SwapSource::Arkham => &self.providers.arkham,
        }
    }

    pub(crate) fn provider_mut(&mut self, source: SwapSource) -> &mut ProviderConfig {
        match source {
            SwapSource::Thorchain => &mut self.providers.thorchain,
            SwapSource::Mayachain => &mut self.providers.mayachain,
            SwapSource::Lifi => &mut self.providers.lifi,
            SwapSource::Arkham => &mut self.providers.arkham,
        }
    }

    /// Enabled sources in configured order; names were checked at load time.
    pub fn enabled_sources(&self) -> Vec<SwapSource> {
        self.sync
            .enabled_sources
            .iter()
            .filter_map(|name| name.parse::<SwapSource>().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
    pub heartbeat_seconds: u64,
    pub migrations_dir: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            heartbeat_seconds: 30,
            migrations_dir: "migrations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "state/swapledger.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_seconds: u64,
    pub max_concurrent_sources: usize,
    pub max_pages_per_cycle: u32,
    pub full_history_max_pages: u32,
    pub page_limit: u32,
    /// Consecutive pages that insert nothing before the run counts as caught up.
    pub zero_insert_page_limit: u32,
    /// Consecutive pages with no events before the walker stops.
    pub empty_page_limit: u32,
    /// Extra attempts for one page after the client has given up on it.
    pub page_retry_budget: u32,
    pub enabled_sources: Vec<String>,
    pub max_reprocess_attempts: u32,
    pub price_warm_max_lookups_per_page: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 900,
            max_concurrent_sources: 4,
            max_pages_per_cycle: 10,
            full_history_max_pages: 1_000,
            page_limit: 50,
            zero_insert_page_limit: 3,
            empty_page_limit: 3,
            page_retry_budget: 1,
            enabled_sources: SwapSource::ALL
                .iter()
                .map(|source| source.as_str().to_string())
                .collect(),
            max_reprocess_attempts: 10,
            price_warm_max_lookups_per_page: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_ms: u64,
    pub timeout_growth_ms: u64,
    pub max_request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_attempts: u32,
    pub server_error_max_attempts: u32,
    pub base_delay_ms: u64,
    pub retry_after_floor_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            timeout_growth_ms: 15_000,
            max_request_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
            max_attempts: 5,
            server_error_max_attempts: 2,
            base_delay_ms: 1_000,
            retry_after_floor_ms: 5_000,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
            user_agent: "swapledger/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AffiliateConfig {
    /// Allow-list of the platform's own referral codes, matched case-insensitively.
    pub codes: Vec<String>,
    pub platform_by_code: BTreeMap<String, String>,
    /// Bridge integrator strings keyed by lowercase substring.
    pub platform_by_integrator: BTreeMap<String, String>,
}

impl Default for AffiliateConfig {
    fn default() -> Self {
        Self {
            codes: vec!["va".to_string(), "vi".to_string(), "v0".to_string()],
            platform_by_code: BTreeMap::from([
                ("va".to_string(), "android".to_string()),
                ("vi".to_string(), "ios".to_string()),
                ("v0".to_string(), "web".to_string()),
            ]),
            platform_by_integrator: BTreeMap::from([
                ("ios".to_string(), "ios".to_string()),
                ("android".to_string(), "android".to_string()),
                ("web".to_string(), "web".to_string()),
                ("mac".to_string(), "mac".to_string()),
                ("windows".to_string(), "windows".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub thorchain: ProviderConfig,
    pub mayachain: ProviderConfig,
    pub lifi: ProviderConfig,
    pub arkham: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            thorchain: ProviderConfig {
                endpoints: vec![
                    "https://midgard.ninerealms.com/v2/actions".to_string(),
                    "https://vanaheimex.com/actions".to_string(),
                    "https://midgard.thorswap.net/v2/actions".to_string(),
                    "https://midgard.thorchain.liquify.com/v2/actions".to_string(),
                ],
                inter_request_delay_ms: 1_500,
                price_history_url: "https://midgard.ninerealms.com/v2/history/swaps".to_string(),
                ..ProviderConfig::default()
            },
            mayachain: ProviderConfig {
                endpoints: vec![
                    "https://midgard.mayachain.info/v2/actions".to_string(),
                    "https://midgard-proxy.odindex.io/v2/actions".to_string(),
                ],
                inter_request_delay_ms: 1_500,
                price_history_url: "https://midgard.mayachain.info/v2/history/swaps".to_string(),
                ..ProviderConfig::default()
            },
            lifi: ProviderConfig {
                endpoints: vec!["https://li.quest/v2/analytics/transfers".to_string()],
                inter_request_delay_ms: 800,
                integrators: vec![
                    "vultisig-ios".to_string(),
                    "vultisig-android".to_string(),
                    "vultisig-web".to_string(),
                    "vultisig-windows".to_string(),
                    "vultisig-mac".to_string(),
                ],
                ..ProviderConfig::default()
            },
            arkham: ProviderConfig {
                endpoints: vec!["https://api.arkhamintelligence.com/transfers".to_string()],
                inter_request_delay_ms: 100,
                page_limit: Some(1_000),
                integrator_address: "0xA4a4f610e89488EB4ECc6c63069f241a54485269".to_string(),
                ..ProviderConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Candidate URLs, tried preferred-first.
    pub endpoints: Vec<String>,
    pub inter_request_delay_ms: u64,
    pub api_key: String,
    /// Overrides `sync.page_limit` for this provider.
    pub page_limit: Option<u32>,
    pub price_history_url: String,
    pub integrators: Vec<String>,
    pub integrator_address: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            inter_request_delay_ms: 1_000,
            api_key: String::new(),
            page_limit: None,
            price_history_url: String::new(),
            integrators: Vec::new(),
            integrator_address: String::new(),
        }
    }
}

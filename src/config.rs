use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::models::BillingStage;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub settlement: SettlementConfig,
    pub billing: BillingConfig,
    pub tax: TaxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// 结算流水线参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// 地址合并阈值, 偏向精确 (误合并比重复工单代价高)
    pub match_threshold: f64,
    pub job_number_attempts: u32,
    pub job_number_backoff_ms: u64,
    /// 每次外部调用的超时
    pub capability_timeout_ms: u64,
    /// 阶段开票认领的有效期, 过期后允许重新认领
    pub stage_claim_lease_secs: u64,
    /// 自动创建工单的 created_by
    pub created_by: String,
    pub public_base_url: String,
    pub rough_in_fraction: BigDecimal,
    pub final_fraction: BigDecimal,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
}

// 启动日志会打印整个配置, 不输出密钥
impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxConfig {
    /// 税率表 (TOML), 为空时使用 default_state_rate 且不区分县
    pub rates_file: Option<String>,
    pub default_state_rate: BigDecimal,
}

/// 定金阶段比例固定为 0.5
pub const DEPOSIT_FRACTION: &str = "0.5";

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.9,
            job_number_attempts: 3,
            job_number_backoff_ms: 50,
            capability_timeout_ms: 10_000,
            stage_claim_lease_secs: 300,
            created_by: "system".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            rough_in_fraction: decimal("0.25"),
            final_fraction: decimal("0.25"),
        }
    }
}

impl SettlementConfig {
    pub fn stage_fraction(&self, stage: BillingStage) -> BigDecimal {
        match stage {
            BillingStage::Deposit => decimal(DEPOSIT_FRACTION),
            BillingStage::RoughIn => self.rough_in_fraction.clone(),
            BillingStage::Final => self.final_fraction.clone(),
        }
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn stage_claim_lease(&self) -> Duration {
        Duration::from_secs(self.stage_claim_lease_secs)
    }

    pub fn job_number_backoff(&self) -> Duration {
        Duration::from_millis(self.job_number_backoff_ms)
    }

    pub fn proposal_link(&self, proposal_id: i64) -> String {
        format!(
            "{}/proposals/{}",
            self.public_base_url.trim_end_matches('/'),
            proposal_id
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/field_service".to_string()),
            },
            settlement: SettlementConfig::default(),
            billing: BillingConfig {
                api_url: "http://localhost:9090".to_string(),
                api_key: String::new(),
            },
            tax: TaxConfig {
                rates_file: None,
                default_state_rate: decimal("0"),
            },
        }
    }
}

fn decimal(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap_or_default()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let defaults = SettlementConfig::default();
        Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("SERVER_PORT", 8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/field_service".to_string()),
            },
            settlement: SettlementConfig {
                match_threshold: env_or("SETTLEMENT_MATCH_THRESHOLD", defaults.match_threshold),
                job_number_attempts: env_or(
                    "SETTLEMENT_JOB_NUMBER_ATTEMPTS",
                    defaults.job_number_attempts,
                )
                .max(1),
                job_number_backoff_ms: env_or(
                    "SETTLEMENT_JOB_NUMBER_BACKOFF_MS",
                    defaults.job_number_backoff_ms,
                ),
                capability_timeout_ms: env_or(
                    "SETTLEMENT_CAPABILITY_TIMEOUT_MS",
                    defaults.capability_timeout_ms,
                ),
                stage_claim_lease_secs: env_or(
                    "SETTLEMENT_STAGE_CLAIM_LEASE_SECS",
                    defaults.stage_claim_lease_secs,
                ),
                created_by: std::env::var("SETTLEMENT_CREATED_BY").unwrap_or(defaults.created_by),
                public_base_url: std::env::var("SETTLEMENT_PUBLIC_BASE_URL")
                    .unwrap_or(defaults.public_base_url),
                rough_in_fraction: env_or("SETTLEMENT_ROUGH_IN_FRACTION", defaults.rough_in_fraction),
                final_fraction: env_or("SETTLEMENT_FINAL_FRACTION", defaults.final_fraction),
            },
            billing: BillingConfig {
                api_url: std::env::var("BILLING_API_URL")
                    .unwrap_or_else(|_| "http://localhost:9090".to_string()),
                api_key: std::env::var("BILLING_API_KEY").unwrap_or_default(),
            },
            tax: TaxConfig {
                rates_file: std::env::var("TAX_RATES_FILE").ok(),
                default_state_rate: env_or("TAX_DEFAULT_STATE_RATE", decimal("0")),
            },
        }
    }
}

use bigdecimal::{BigDecimal, Zero};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::TaxError;
use crate::models::TaxBreakdown;
use crate::service::address::{normalize, CanonicalAddress};

pub const UNKNOWN_COUNTY: &str = "Unknown County";

/// 计税用的邮政地址
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostalAddress {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

impl From<&CanonicalAddress> for PostalAddress {
    fn from(a: &CanonicalAddress) -> Self {
        Self {
            street: a.street_line(),
            city: a.city.clone(),
            state: a.state.clone(),
            zip: a.zip.clone(),
        }
    }
}

impl PostalAddress {
    pub fn parse(address: &str) -> Self {
        Self::from(&normalize(address))
    }
}

/// 税率解析 (对同一地址必须确定性, 视为纯函数)
pub trait TaxResolver: Send + Sync {
    fn resolve(&self, subtotal: &BigDecimal, address: &PostalAddress)
        -> Result<TaxBreakdown, TaxError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountyRate {
    pub name: String,
    pub rate: BigDecimal,
}

/// 税率表: 州税按州代码, 县税按邮编
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateTable {
    #[serde(default)]
    pub states: HashMap<String, BigDecimal>,
    #[serde(default)]
    pub counties: HashMap<String, CountyRate>,
}

/// 基于税率表的实现
#[derive(Debug, Clone)]
pub struct RateTableTaxResolver {
    table: RateTable,
    default_state_rate: BigDecimal,
}

impl RateTableTaxResolver {
    pub fn new(table: RateTable, default_state_rate: BigDecimal) -> Self {
        let table = RateTable {
            states: table
                .states
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            counties: table.counties,
        };
        Self {
            table,
            default_state_rate,
        }
    }

    /// 从 TOML 文件加载税率表
    pub fn from_file(path: &str, default_state_rate: BigDecimal) -> Result<Self, config::ConfigError> {
        let table: RateTable = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;
        tracing::info!(
            states = table.states.len(),
            counties = table.counties.len(),
            "Tax rate table loaded from {}",
            path
        );
        Ok(Self::new(table, default_state_rate))
    }
}

fn cents(amount: BigDecimal) -> BigDecimal {
    amount.round(2).with_scale(2)
}

impl TaxResolver for RateTableTaxResolver {
    fn resolve(
        &self,
        subtotal: &BigDecimal,
        address: &PostalAddress,
    ) -> Result<TaxBreakdown, TaxError> {
        if address.state.is_none() && address.zip.is_none() {
            return Err(TaxError::Unresolvable(format!("{:?}", address)));
        }

        let state_tax_rate = address
            .state
            .as_deref()
            .and_then(|s| self.table.states.get(&s.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| self.default_state_rate.clone());

        let (county, county_tax_rate) = match address
            .zip
            .as_deref()
            .and_then(|z| self.table.counties.get(z))
        {
            Some(c) => (c.name.clone(), c.rate.clone()),
            None => (UNKNOWN_COUNTY.to_string(), BigDecimal::zero()),
        };

        let state_tax_amount = cents(subtotal * &state_tax_rate);
        let county_tax_amount = cents(subtotal * &county_tax_rate);
        let total_tax_amount = &state_tax_amount + &county_tax_amount;
        let total = cents(subtotal + &total_tax_amount);

        Ok(TaxBreakdown {
            state_tax_rate,
            county_tax_rate,
            state_tax_amount,
            county_tax_amount,
            county,
            total_tax_amount,
            total,
        })
    }
}

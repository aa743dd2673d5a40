use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 客户
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub billing_external_id: Option<String>,
}

impl Customer {
    /// 服务地址 (空白视为缺失)
    pub fn service_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

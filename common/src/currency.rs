//! Currencies an account can be denominated in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// Supported ISO 4217 currency.
///
/// Balances are stored in the smallest unit of the currency (cents), so no
/// decimal scale is carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// US Dollar.
    Usd,
    /// Canadian Dollar.
    Cad,
    /// Mexican Peso.
    Mxn,
}

impl Currency {
    /// All supported currencies.
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Cad, Currency::Mxn];

    /// Get the ISO code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Cad => "CAD",
            Currency::Mxn => "MXN",
        }
    }

    /// Check whether a currency code is supported.
    pub fn is_supported(code: &str) -> bool {
        code.parse::<Currency>().is_ok()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Currency {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::Usd),
            "CAD" => Ok(Currency::Cad),
            "MXN" => Ok(Currency::Mxn),
            other => Err(CommonError::UnsupportedCurrency(other.to_string())),
        }
    }
}

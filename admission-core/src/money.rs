//! Currency-aware monetary value, layered on `common-money`'s scale
//! normalization.

use bigdecimal::BigDecimal;
use common_money::NormalizedMoney;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub currency_code: String,
    amount: NormalizedMoney,
}

impl Money {
    pub fn new(currency_code: impl Into<String>, amount: BigDecimal) -> Self {
        Self {
            currency_code: currency_code.into(),
            amount: NormalizedMoney::new(amount),
        }
    }

    pub fn amount(&self) -> &BigDecimal {
        self.amount.inner()
    }

    /// Adds two money values of the same currency. A currency mismatch is a
    /// caller error surfaced when merging metric values.
    pub fn add(&self, other: &Money) -> CoreResult<Money> {
        if self.currency_code != other.currency_code {
            return Err(CoreError::argument(format!(
                "cannot add money values with differing currencies: {} vs {}",
                self.currency_code, other.currency_code
            )));
        }
        Ok(Money::new(
            self.currency_code.clone(),
            self.amount().clone() + other.amount().clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn add_same_currency() {
        let a = Money::new("USD", BigDecimal::from_str("1.10").unwrap());
        let b = Money::new("USD", BigDecimal::from_str("2.20").unwrap());
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.amount().to_string(), "3.30");
    }

    #[test]
    fn add_mismatched_currency_is_argument_error() {
        let a = Money::new("USD", BigDecimal::from_str("1.00").unwrap());
        let b = Money::new("EUR", BigDecimal::from_str("1.00").unwrap());
        assert!(a.add(&b).is_err());
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Currencies accepted by the service. Everything else is rejected at the
/// edge, so the rest of the pipeline never sees an unknown code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Gbp,
    Usd,
}

#[derive(Debug, Error, PartialEq)]
#[error("unsupported currency {0}, must be one of EUR, GBP, USD")]
pub struct UnsupportedCurrency(pub String);

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Usd => "USD",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Currency::Eur => "€",
            Currency::Gbp => "£",
            Currency::Usd => "$",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = UnsupportedCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "USD" => Ok(Currency::Usd),
            other => Err(UnsupportedCurrency(other.to_owned())),
        }
    }
}

/// An amount in minor units of a currency. Balances never travel as floats;
/// formatting for display happens here and nowhere else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    #[serde(rename = "amountMinor")]
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount_minor: i64, currency: Currency) -> Self {
        Self {
            amount_minor,
            currency,
        }
    }
}

// All three supported currencies carry two decimal places.
const MINOR_PER_UNIT: i64 = 100;

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount_minor < 0 { "-" } else { "" };
        let units = (self.amount_minor / MINOR_PER_UNIT).abs();
        let cents = (self.amount_minor % MINOR_PER_UNIT).abs();
        write!(f, "{sign}{}{units}.{cents:02}", self.currency.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::*;

    impl Arbitrary for Currency {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[Currency::Eur, Currency::Gbp, Currency::Usd])
                .unwrap()
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::new(23240, Currency::Gbp).to_string(), "£232.40");
        assert_eq!(Money::new(5, Currency::Eur).to_string(), "€0.05");
        assert_eq!(Money::new(100, Currency::Usd).to_string(), "$1.00");
        assert_eq!(Money::new(0, Currency::Gbp).to_string(), "£0.00");
    }

    #[test]
    fn test_display_negative() {
        assert_eq!(Money::new(-50, Currency::Gbp).to_string(), "-£0.50");
        assert_eq!(Money::new(-12345, Currency::Usd).to_string(), "-$123.45");
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!("GBP".parse(), Ok(Currency::Gbp));
        assert_eq!("EUR".parse(), Ok(Currency::Eur));
        assert_eq!("USD".parse(), Ok(Currency::Usd));
        assert!("HUF".parse::<Currency>().is_err());
        // lowercase codes are not accepted
        assert!("gbp".parse::<Currency>().is_err());
    }

    #[quickcheck]
    fn test_code_parse_roundtrip(currency: Currency) {
        assert_eq!(currency.code().parse(), Ok(currency));
    }

    #[quickcheck]
    fn test_display_always_two_decimals(minor: i64, currency: Currency) {
        let rendered = Money::new(minor, currency).to_string();
        let (_, decimals) = rendered.split_once('.').unwrap();
        assert_eq!(decimals.len(), 2);
    }
}

//! Partition identity: `(service_type, source_year, source_month)`.
//!
//! The partition key is the unit of load granularity. Rows in the OBT carry the key copied from
//! the raw record, never recomputed from the pickup timestamp.

/// Taxi service variant. Each one is read from its own raw table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum ServiceType {
    Yellow,
    Green,
}

impl ServiceType {
    /// All services, in processing order.
    pub const ALL: [ServiceType; 2] = [ServiceType::Yellow, ServiceType::Green];

    /// The `service_type` discriminator stored in the OBT.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Green => "green",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = UnknownServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("yellow") => Ok(Self::Yellow),
            s if s.eq_ignore_ascii_case("green") => Ok(Self::Green),
            other => Err(UnknownServiceError(other.to_string())),
        }
    }
}

/// Returned when parsing a service name other than `yellow` or `green`.
#[derive(Debug, thiserror::Error)]
#[error("unknown service type '{0}', expected 'yellow' or 'green'")]
pub struct UnknownServiceError(String);

/// A calendar month, 1 through 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(u8);

impl Month {
    /// Creates a month, rejecting values outside `1..=12`.
    pub fn new(month: u8) -> Result<Self, InvalidMonthError> {
        if (1..=12).contains(&month) {
            Ok(Self(month))
        } else {
            Err(InvalidMonthError(month.to_string()))
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// January through December.
    pub fn all() -> impl Iterator<Item = Month> {
        (1..=12).map(Month)
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl std::str::FromStr for Month {
    type Err = InvalidMonthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let month = s
            .trim()
            .parse::<u8>()
            .map_err(|_| InvalidMonthError(s.to_string()))?;
        Month::new(month).map_err(|_| InvalidMonthError(s.to_string()))
    }
}

impl From<Month> for i32 {
    fn from(month: Month) -> Self {
        i32::from(month.0)
    }
}

/// Returned for month values outside `1..=12`.
#[derive(Debug, thiserror::Error)]
#[error("invalid month '{0}', expected a number between 1 and 12")]
pub struct InvalidMonthError(String);

/// One `(service, source_year, source_month)` partition of the OBT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub service: ServiceType,
    pub year: i32,
    pub month: Month,
}

impl Partition {
    pub fn new(service: ServiceType, year: i32, month: Month) -> Self {
        Self {
            service,
            year,
            month,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}-{}", self.service, self.year, self.month)
    }
}

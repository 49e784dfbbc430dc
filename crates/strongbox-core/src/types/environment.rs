//! Deployment environments and override layering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IdentifierError;

/// Deployment environment an entry belongs to.
///
/// `Base` holds the defaults every environment inherits. The others only
/// hold overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Base,
    Development,
    Staging,
    Production,
    Edge,
}

impl Environment {
    pub const ALL: [Environment; 5] = [
        Self::Base,
        Self::Development,
        Self::Staging,
        Self::Production,
        Self::Edge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Edge => "edge",
        }
    }

    pub fn is_base(&self) -> bool {
        *self == Self::Base
    }

    /// Layers that resolve a value in this environment, lowest precedence
    /// first. Production inherits staging, which inherits development.
    /// Edge sits directly on base.
    pub fn layers(self) -> &'static [Environment] {
        use Environment::*;
        match self {
            Base => &[Base],
            Development => &[Base, Development],
            Staging => &[Base, Development, Staging],
            Production => &[Base, Development, Staging, Production],
            Edge => &[Base, Edge],
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "dev" | "development" => Ok(Self::Development),
            "stage" | "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            "edge" => Ok(Self::Edge),
            _ => Err(IdentifierError::UnknownEnvironment(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_inherits_the_chain() {
        assert_eq!(
            Environment::Production.layers(),
            &[
                Environment::Base,
                Environment::Development,
                Environment::Staging,
                Environment::Production
            ]
        );
        assert_eq!(Environment::Edge.layers(), &[Environment::Base, Environment::Edge]);
        assert_eq!(Environment::Base.layers(), &[Environment::Base]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert!("qa".parse::<Environment>().is_err());
        assert_eq!(serde_json::to_string(&Environment::Edge).unwrap(), "\"edge\"");
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::employee::EmployeeId;
use crate::errors::AuthorizationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowScope {
    OwnOnly,
    OwnAndSubtree,
    DivisionOnly,
    All,
}

impl RowScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnOnly => "own_only",
            Self::OwnAndSubtree => "own_and_subtree",
            Self::DivisionOnly => "division_only",
            Self::All => "all",
        }
    }
}

impl std::str::FromStr for RowScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "own_only" => Ok(Self::OwnOnly),
            "own_and_subtree" => Ok(Self::OwnAndSubtree),
            "division_only" => Ok(Self::DivisionOnly),
            "all" => Ok(Self::All),
            other => Err(format!("unknown row scope `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub proactive_insights: bool,
    pub recommendations: bool,
    pub forecasting: bool,
    pub org_structure: bool,
    pub free_query: bool,
}

/// What a caller may see. Produced by the administrative workflow and only read here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub employee_id: EmployeeId,
    pub division: String,
    pub unit: Option<String>,
    pub role_name: String,
    pub row_scope: RowScope,
    pub capabilities: Capabilities,
    pub table_allow: Vec<String>,
    pub table_deny: Vec<String>,
    pub persona_id: Option<String>,
}

impl AccessGrant {
    /// Deny entries always win. An empty allow list admits every table that is not denied.
    pub fn table_permitted(&self, table: &str) -> bool {
        let table = table.trim().to_ascii_lowercase();
        if self.table_deny.iter().any(|denied| denied.eq_ignore_ascii_case(&table)) {
            return false;
        }
        self.table_allow.is_empty()
            || self.table_allow.iter().any(|allowed| allowed.eq_ignore_ascii_case(&table))
    }

    pub fn require_proactive(&self) -> Result<(), AuthorizationError> {
        if self.capabilities.proactive_insights {
            Ok(())
        } else {
            Err(AuthorizationError::CapabilityDenied { capability: "proactive_insights" })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub tone: String,
    pub format_guidance: String,
}

/// The resolved identity set: an explicit finite set, or the `all` sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibleSet {
    All,
    Only(BTreeSet<EmployeeId>),
}

impl VisibleSet {
    pub fn only_self(id: EmployeeId) -> Self {
        Self::Only(BTreeSet::from([id]))
    }

    pub fn contains(&self, id: EmployeeId) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(&id),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// `None` for the `all` sentinel.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Only(ids) => Some(ids.len()),
        }
    }

    pub fn ids(&self) -> Option<&BTreeSet<EmployeeId>> {
        match self {
            Self::All => None,
            Self::Only(ids) => Some(ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(allow: &[&str], deny: &[&str]) -> AccessGrant {
        AccessGrant {
            employee_id: EmployeeId(1),
            division: "north".to_string(),
            unit: None,
            role_name: "analyst".to_string(),
            row_scope: RowScope::All,
            capabilities: Capabilities { free_query: true, ..Capabilities::default() },
            table_allow: allow.iter().map(ToString::to_string).collect(),
            table_deny: deny.iter().map(ToString::to_string).collect(),
            persona_id: None,
        }
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let grant = grant(&["sales", "employees"], &["employees"]);
        assert!(grant.table_permitted("sales"));
        assert!(!grant.table_permitted("EMPLOYEES"));
        assert!(!grant.table_permitted("sales_targets"));
    }

    #[test]
    fn empty_allow_list_admits_everything_not_denied() {
        let grant = grant(&[], &["employees"]);
        assert!(grant.table_permitted("sales_targets"));
        assert!(!grant.table_permitted("employees"));
    }

    #[test]
    fn row_scope_parses_snake_case() {
        assert_eq!("own_and_subtree".parse::<RowScope>(), Ok(RowScope::OwnAndSubtree));
        assert!("everyone".parse::<RowScope>().is_err());
    }

    #[test]
    fn all_sentinel_contains_everyone() {
        assert!(VisibleSet::All.contains(EmployeeId(999)));
        assert!(!VisibleSet::only_self(EmployeeId(1)).contains(EmployeeId(2)));
        assert_eq!(VisibleSet::All.len(), None);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub i64);

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An employee as the identity graph sees them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
    pub title: String,
    pub division: String,
    pub unit: Option<String>,
    pub manager_id: Option<EmployeeId>,
    pub active: bool,
}

impl Employee {
    pub fn reports_to(&self, manager: EmployeeId) -> bool {
        self.manager_id == Some(manager) && self.id != manager
    }
}

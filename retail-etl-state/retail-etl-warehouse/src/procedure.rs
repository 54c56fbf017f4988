use std::{fmt, str::FromStr};

use crate::error::WarehouseError;

pub const DEFAULT_PROCEDURE: &str = "pkg_etl_retail.load_daily_sales";

/// A validated, possibly schema-qualified, stored procedure name.
///
/// Only identifier characters are accepted so the name can be spliced into
/// a `CALL` statement as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureName(String);

impl ProcedureName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn call_statement(&self) -> String {
        format!("CALL {}()", self.0)
    }

    fn valid_segment(segment: &str) -> bool {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#'))
    }
}

impl FromStr for ProcedureName {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let segments: Vec<&str> = name.split('.').collect();

        if name.is_empty()
            || segments.len() > 3
            || !segments.iter().all(|seg| Self::valid_segment(seg))
        {
            return Err(WarehouseError::InvalidProcedure(s.to_string()));
        }

        Ok(Self(name.to_string()))
    }
}

impl fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

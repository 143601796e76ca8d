//! Route decisions handed in by the router

use std::hash::{Hash, Hasher};

/// One shard plus the statement to run there.
///
/// Equality and hashing use the data node name only, so a session keeps at most one
/// binding per shard regardless of the statement text.
#[derive(Debug, Clone)]
pub struct ShardTarget {
    pub name: String,
    pub statement: String,
}

impl ShardTarget {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: statement.into(),
        }
    }
}

impl PartialEq for ShardTarget {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ShardTarget {}

impl Hash for ShardTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Other,
}

impl SqlType {
    /// Classify by leading keyword
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| !c.is_ascii_alphabetic())
            .next()
            .unwrap_or("");
        match keyword.to_ascii_lowercase().as_str() {
            "select" | "show" => SqlType::Select,
            "insert" => SqlType::Insert,
            "update" => SqlType::Update,
            "delete" => SqlType::Delete,
            "replace" => SqlType::Replace,
            _ => SqlType::Other,
        }
    }

    pub fn is_modify(&self) -> bool {
        matches!(
            self,
            SqlType::Insert | SqlType::Update | SqlType::Delete | SqlType::Replace
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SqlType::Select => "select",
            SqlType::Insert => "insert",
            SqlType::Update => "update",
            SqlType::Delete => "delete",
            SqlType::Replace => "replace",
            SqlType::Other => "other",
        }
    }
}

/// Targets of one client statement
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub targets: Vec<ShardTarget>,
    pub sql_type: SqlType,
}

impl RouteResult {
    pub fn new(targets: Vec<ShardTarget>, sql_type: SqlType) -> Self {
        Self { targets, sql_type }
    }

    /// Same statement on every node
    pub fn broadcast<S: AsRef<str>>(nodes: &[S], statement: &str) -> Self {
        Self {
            targets: nodes
                .iter()
                .map(|n| ShardTarget::new(n.as_ref(), statement))
                .collect(),
            sql_type: SqlType::classify(statement),
        }
    }
}

//! Permission node parsing and wildcard lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Maximum length of a permission node in bytes.
pub const MAX_NODE_LENGTH: usize = 256;

/// The wildcard segment.
pub const WILDCARD: &str = "*";

/// A dotted permission node, optionally ending in a `*` wildcard segment.
///
/// Nodes are normalized to lowercase on parse. Valid examples: `chat.send`,
/// `world.build.*`, `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionNode(String);

impl PermissionNode {
    /// Parses and normalizes a permission node.
    pub fn parse(input: &str) -> DomainResult<Self> {
        let node = input.trim().to_lowercase();
        let invalid = |reason: &str| DomainError::InvalidNode {
            node: input.to_string(),
            reason: reason.to_string(),
        };

        if node.is_empty() {
            return Err(invalid("node cannot be empty"));
        }
        if node.len() > MAX_NODE_LENGTH {
            return Err(invalid("node exceeds maximum length"));
        }

        let segments: Vec<&str> = node.split('.').collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if *segment == WILDCARD {
                if i != last {
                    return Err(invalid("wildcard must be the last segment"));
                }
                continue;
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))
            {
                return Err(invalid("segments may only contain [a-z0-9_-:] or be '*'"));
            }
        }

        Ok(Self(node))
    }

    /// Returns the node as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the node ends in a wildcard segment.
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD || self.0.ends_with(".*")
    }

    /// Returns the patterns to consult for this node, most specific first.
    ///
    /// `a.b.c` yields `a.b.c`, `a.b.*`, `a.*`, `*`.
    pub fn lookup_chain(&self) -> Vec<String> {
        let mut chain = vec![self.0.clone()];
        if self.0 == WILDCARD {
            return chain;
        }

        let base: Vec<&str> = if self.is_wildcard() {
            let mut segments: Vec<&str> = self.0.split('.').collect();
            segments.pop();
            segments
        } else {
            self.0.split('.').collect()
        };

        for k in (1..base.len()).rev() {
            chain.push(format!("{}.{WILDCARD}", base[..k].join(".")));
        }
        chain.push(WILDCARD.to_string());
        chain
    }
}

impl fmt::Display for PermissionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PermissionNode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermissionNode> for String {
    fn from(node: PermissionNode) -> Self {
        node.0
    }
}

impl std::str::FromStr for PermissionNode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

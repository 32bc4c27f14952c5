//! Property-based tests for permission nodes.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::model::PermissionNode;

    /// Strategy for concrete dotted nodes like "world.build.place".
    fn concrete_node_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9_]{1,8}", 1..6).prop_map(|segments| segments.join("."))
    }

    proptest! {
        #[test]
        fn test_concrete_nodes_parse_and_roundtrip(node in concrete_node_strategy()) {
            let parsed = PermissionNode::parse(&node);
            prop_assert!(parsed.is_ok(), "Failed for node: {}", node);
            let parsed = parsed.unwrap();
            prop_assert_eq!(parsed.as_str(), node.as_str());
            prop_assert!(!parsed.is_wildcard());
        }

        #[test]
        fn test_uppercase_input_normalizes_to_lowercase(node in concrete_node_strategy()) {
            let upper = PermissionNode::parse(&node.to_uppercase()).unwrap();
            prop_assert_eq!(upper.as_str(), node.as_str());
        }

        #[test]
        fn test_lookup_chain_is_exact_then_prefixes_then_root(node in concrete_node_strategy()) {
            let parsed = PermissionNode::parse(&node).unwrap();
            let chain = parsed.lookup_chain();
            let segment_count = node.split('.').count();

            prop_assert_eq!(chain.first().map(String::as_str), Some(node.as_str()));
            prop_assert_eq!(chain.last().map(String::as_str), Some("*"));
            prop_assert_eq!(chain.len(), segment_count + 1);

            // Every wildcard entry covers the node and gets strictly shorter.
            for pair in chain[1..].windows(2) {
                prop_assert!(pair[0].len() > pair[1].len());
            }
            for pattern in &chain[1..chain.len() - 1] {
                let prefix = pattern.trim_end_matches('*');
                prop_assert!(node.starts_with(prefix));
            }
        }

        #[test]
        fn test_wildcard_in_middle_is_rejected(
            head in "[a-z]{1,8}",
            tail in "[a-z]{1,8}"
        ) {
            let node = format!("{head}.*.{tail}");
            prop_assert!(PermissionNode::parse(&node).is_err());
        }
    }
}

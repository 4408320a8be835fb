//! Kubernetes-style RBAC rule matching.
//!
//! A rule set allows a request iff at least one rule matches the request's
//! API group, verb, and resource (each with `*` wildcard support), and, when
//! the rule lists `resourceNames`, the target object's name is in that list.
//! Non-resource requests are never allowed by resource rules; callers handle
//! the exempt paths before asking.

use serde::{Deserialize, Serialize};

use super::request_info::RequestAttributes;

const WILDCARD: &str = "*";

/// Mirror of a Kubernetes RBAC policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRule {
    pub api_groups: Vec<String>,
    pub verbs: Vec<String>,
    pub resources: Vec<String>,
    pub resource_names: Vec<String>,
}

/// The per-cluster access grant decoded from a token's `scopes` claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    pub namespaces: Vec<String>,
    pub rules: Vec<PolicyRule>,
}

/// Empty namespace list means any namespace is allowed.
pub fn namespace_matches(namespaces: &[String], namespace: &str) -> bool {
    namespaces.is_empty()
        || namespaces
            .iter()
            .any(|ns| ns == WILDCARD || ns == namespace)
}

/// Whether any rule in the set allows the request.
pub fn rules_allow(attrs: &RequestAttributes, rules: &[PolicyRule]) -> bool {
    rules.iter().any(|rule| rule_allows(attrs, rule))
}

fn rule_allows(attrs: &RequestAttributes, rule: &PolicyRule) -> bool {
    if !attrs.is_resource_request {
        return false;
    }

    api_group_matches(rule, &attrs.api_group)
        && verb_matches(rule, &attrs.verb)
        && resource_matches(rule, &attrs.resource, &attrs.subresource)
        && resource_name_matches(rule, &attrs.name)
}

fn api_group_matches(rule: &PolicyRule, group: &str) -> bool {
    rule.api_groups.iter().any(|g| g == WILDCARD || g == group)
}

fn verb_matches(rule: &PolicyRule, verb: &str) -> bool {
    rule.verbs.iter().any(|v| v == WILDCARD || v == verb)
}

fn resource_matches(rule: &PolicyRule, resource: &str, subresource: &str) -> bool {
    let combined = if subresource.is_empty() {
        resource.to_string()
    } else {
        format!("{resource}/{subresource}")
    };

    rule.resources.iter().any(|r| {
        r == WILDCARD
            || *r == combined
            // "pods/*" grants every subresource of pods.
            || (!subresource.is_empty() && *r == format!("{resource}/{WILDCARD}"))
    })
}

fn resource_name_matches(rule: &PolicyRule, name: &str) -> bool {
    rule.resource_names.is_empty() || rule.resource_names.iter().any(|n| n == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn attrs(method: Method, path: &str) -> RequestAttributes {
        RequestAttributes::parse(&method, path, "")
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rule_matching_truth_table() {
        let rules = vec![
            PolicyRule {
                api_groups: strings(&[""]),
                verbs: strings(&["list"]),
                resources: strings(&["*"]),
                resource_names: vec![],
            },
            PolicyRule {
                api_groups: strings(&[""]),
                verbs: strings(&["get"]),
                resources: strings(&["*"]),
                resource_names: strings(&["a"]),
            },
        ];

        assert!(rules_allow(
            &attrs(Method::GET, "/api/v1/namespaces/default/pods"),
            &rules
        ));
        assert!(rules_allow(
            &attrs(Method::GET, "/api/v1/namespaces/default/pods/a/logs"),
            &rules
        ));
        assert!(!rules_allow(
            &attrs(Method::GET, "/api/v1/namespaces/default/pods/b/logs"),
            &rules
        ));
        assert!(!rules_allow(
            &attrs(Method::POST, "/api/v1/namespaces/default/pods"),
            &rules
        ));
        assert!(!rules_allow(
            &attrs(
                Method::GET,
                "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews"
            ),
            &rules
        ));
    }

    #[test]
    fn test_wildcard_verb_and_group() {
        let rules = vec![PolicyRule {
            api_groups: strings(&["*"]),
            verbs: strings(&["*"]),
            resources: strings(&["deployments"]),
            resource_names: vec![],
        }];

        assert!(rules_allow(
            &attrs(Method::PATCH, "/apis/apps/v1/namespaces/x/deployments/web"),
            &rules
        ));
        assert!(!rules_allow(
            &attrs(Method::GET, "/apis/apps/v1/namespaces/x/replicasets"),
            &rules
        ));
    }

    #[test]
    fn test_subresource_wildcard() {
        let rules = vec![PolicyRule {
            api_groups: strings(&[""]),
            verbs: strings(&["get"]),
            resources: strings(&["pods/*"]),
            resource_names: vec![],
        }];

        assert!(rules_allow(
            &attrs(Method::GET, "/api/v1/namespaces/default/pods/a/exec"),
            &rules
        ));
        // Bare resource is not covered by the subresource wildcard.
        assert!(!rules_allow(
            &attrs(Method::GET, "/api/v1/namespaces/default/pods/a"),
            &rules
        ));
    }

    #[test]
    fn test_non_resource_request_denied() {
        let rules = vec![PolicyRule {
            api_groups: strings(&["*"]),
            verbs: strings(&["*"]),
            resources: strings(&["*"]),
            resource_names: vec![],
        }];
        assert!(!rules_allow(&attrs(Method::GET, "/healthz"), &rules));
    }

    #[test]
    fn test_namespace_matching() {
        assert!(namespace_matches(&[], "default"));
        assert!(namespace_matches(&strings(&["*"]), "default"));
        assert!(namespace_matches(&strings(&["default", "dev"]), "dev"));
        assert!(!namespace_matches(&strings(&["dev"]), "default"));
    }
}

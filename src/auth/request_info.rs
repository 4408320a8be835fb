//! Kubernetes API request attribute parsing.
//!
//! Maps a proxied request's method and path onto the attributes RBAC rules
//! are matched against: verb, API group/version, namespace, resource, name,
//! subresource. Paths are parsed after the `/proxies/{agentHost}` prefix is
//! stripped; `/api/...` is the groupless core API, `/apis/{group}/...` the
//! grouped form. Anything else is a non-resource request.

use http::Method;

/// Attributes of one proxied request, as seen by the authorizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    /// Full request path, prefix included.
    pub path: String,
    pub verb: String,
    pub is_resource_request: bool,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
}

impl RequestAttributes {
    /// Parse attributes from a request path. `prefix` is the mount point to
    /// strip (e.g. `/proxies/local`); pass `""` for bare API paths.
    pub fn parse(method: &Method, path_and_query: &str, prefix: &str) -> Self {
        let path = path_and_query
            .split_once('?')
            .map(|(p, _)| p)
            .unwrap_or(path_and_query);
        let query = path_and_query.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut attrs = RequestAttributes {
            path: path.to_string(),
            verb: method.as_str().to_lowercase(),
            ..Default::default()
        };

        let local = path.strip_prefix(prefix).unwrap_or(path);
        let parts: Vec<&str> = local.split('/').filter(|s| !s.is_empty()).collect();

        // A resource request needs at least prefix + version + resource.
        if parts.len() < 3 {
            return attrs;
        }

        let rest: &[&str] = match parts[0] {
            "api" => {
                attrs.api_version = parts[1].to_string();
                &parts[2..]
            }
            "apis" => {
                if parts.len() < 4 {
                    return attrs;
                }
                attrs.api_group = parts[1].to_string();
                attrs.api_version = parts[2].to_string();
                &parts[3..]
            }
            _ => return attrs,
        };

        attrs.is_resource_request = true;

        let rest: &[&str] = if rest[0] == "namespaces" && rest.len() >= 3 {
            attrs.namespace = rest[1].to_string();
            &rest[2..]
        } else {
            rest
        };

        attrs.resource = rest[0].to_string();
        if rest.len() > 1 {
            attrs.name = rest[1].to_string();
        }
        if rest.len() > 2 {
            attrs.subresource = rest[2].to_string();
        }

        attrs.verb = resource_verb(method, &attrs.name, query);
        attrs
    }
}

fn resource_verb(method: &Method, name: &str, query: &str) -> String {
    let watching = query
        .split('&')
        .any(|kv| kv == "watch=true" || kv == "watch=1" || kv == "watch");

    if method == Method::GET || method == Method::HEAD {
        if watching {
            "watch".into()
        } else if name.is_empty() {
            "list".into()
        } else {
            "get".into()
        }
    } else if method == Method::POST {
        "create".into()
    } else if method == Method::PUT {
        "update".into()
    } else if method == Method::PATCH {
        "patch".into()
    } else if method == Method::DELETE {
        if name.is_empty() {
            "deletecollection".into()
        } else {
            "delete".into()
        }
    } else {
        method.as_str().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_api_collection() {
        let a = RequestAttributes::parse(&Method::GET, "/api/v1/namespaces/default/pods", "");
        assert!(a.is_resource_request);
        assert_eq!(a.verb, "list");
        assert_eq!(a.api_group, "");
        assert_eq!(a.namespace, "default");
        assert_eq!(a.resource, "pods");
        assert_eq!(a.name, "");
    }

    #[test]
    fn test_core_api_subresource() {
        let a = RequestAttributes::parse(&Method::GET, "/api/v1/namespaces/default/pods/a/logs", "");
        assert_eq!(a.verb, "get");
        assert_eq!(a.resource, "pods");
        assert_eq!(a.name, "a");
        assert_eq!(a.subresource, "logs");
    }

    #[test]
    fn test_grouped_api() {
        let a = RequestAttributes::parse(
            &Method::POST,
            "/apis/apps/v1/namespaces/kube-system/deployments",
            "",
        );
        assert_eq!(a.api_group, "apps");
        assert_eq!(a.api_version, "v1");
        assert_eq!(a.verb, "create");
        assert_eq!(a.resource, "deployments");
    }

    #[test]
    fn test_cluster_scoped_resource() {
        let a = RequestAttributes::parse(&Method::GET, "/api/v1/nodes/worker-0", "");
        assert_eq!(a.namespace, "");
        assert_eq!(a.resource, "nodes");
        assert_eq!(a.name, "worker-0");
        assert_eq!(a.verb, "get");
    }

    #[test]
    fn test_prefix_stripped() {
        let a = RequestAttributes::parse(
            &Method::GET,
            "/proxies/local/api/v1/namespaces/default/pods",
            "/proxies/local",
        );
        assert!(a.is_resource_request);
        assert_eq!(a.resource, "pods");
        assert_eq!(a.path, "/proxies/local/api/v1/namespaces/default/pods");
    }

    #[test]
    fn test_non_resource_path() {
        let a = RequestAttributes::parse(&Method::GET, "/proxies/local/version", "/proxies/local");
        assert!(!a.is_resource_request);
        assert_eq!(a.verb, "get");
    }

    #[test]
    fn test_watch_query() {
        let a = RequestAttributes::parse(
            &Method::GET,
            "/api/v1/namespaces/default/pods?watch=1",
            "",
        );
        assert_eq!(a.verb, "watch");
    }

    #[test]
    fn test_delete_collection() {
        let a = RequestAttributes::parse(&Method::DELETE, "/api/v1/namespaces/default/pods", "");
        assert_eq!(a.verb, "deletecollection");
    }
}

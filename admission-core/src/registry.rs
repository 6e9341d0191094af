//! Maps (HTTP verb, URL path) of an incoming request to a method
//! descriptor. Compiled once from a `ServiceDescriptor` and immutable
//! thereafter.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::{HttpVerb, MethodInfo, ServiceDescriptor};

struct CompiledRoute {
    verb: HttpVerb,
    pattern: Regex,
    param_names: Vec<String>,
    info: Arc<MethodInfo>,
}

pub struct MethodRegistry {
    routes: Vec<CompiledRoute>,
}

/// Result of a successful lookup: the method descriptor plus any path
/// variables bound by the template.
pub struct MethodMatch {
    pub info: Arc<MethodInfo>,
    pub path_params: HashMap<String, String>,
}

impl MethodRegistry {
    /// Builds a registry once from a `ServiceDescriptor`. Method descriptors
    /// are derived here and shared (`Arc`) for the lifetime of the service.
    pub fn from_service(service: &ServiceDescriptor) -> Self {
        let mut routes = Vec::with_capacity(service.http_rules.len());
        for rule in &service.http_rules {
            let info = Arc::new(MethodInfo {
                selector: rule.selector.clone(),
                auth_policy: service.auth_policies.get(&rule.selector).cloned(),
                quota_policy: service
                    .quota_policies
                    .get(&rule.selector)
                    .cloned()
                    .unwrap_or_default(),
            });
            let (pattern, param_names) = compile_template(&rule.url_template);
            routes.push(CompiledRoute {
                verb: rule.verb,
                pattern,
                param_names,
                info,
            });
        }
        Self { routes }
    }

    /// Looks up the method descriptor for an incoming request's verb and
    /// path. A single trailing slash on `path` is ignored.
    pub fn lookup(&self, verb: HttpVerb, path: &str) -> Option<MethodMatch> {
        for route in &self.routes {
            if route.verb != verb {
                continue;
            }
            if let Some(captures) = route.pattern.captures(path) {
                let mut path_params = HashMap::with_capacity(route.param_names.len());
                for (i, name) in route.param_names.iter().enumerate() {
                    if let Some(value) = captures.get(i + 1) {
                        path_params.insert(name.clone(), value.as_str().to_string());
                    }
                }
                return Some(MethodMatch {
                    info: route.info.clone(),
                    path_params,
                });
            }
        }
        None
    }
}

/// Compiles a URL template such as `/v1/foo/{bar}/baz` into a regex that
/// binds `{name}` segments as capture groups and tolerates exactly one
/// trailing slash.
fn compile_template(template: &str) -> (Regex, Vec<String>) {
    let mut pattern = String::with_capacity(template.len() + 8);
    pattern.push('^');
    let mut param_names = Vec::new();

    for segment in template.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment.starts_with('{') && segment.ends_with('}') {
            let name = segment
                .trim_start_matches('{')
                .trim_end_matches('}')
                .to_string();
            pattern.push_str("/([^/]+)");
            param_names.push(name);
        } else {
            pattern.push('/');
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push_str("/?$");

    let regex = Regex::new(&pattern).expect("url template compiles to a valid regex");
    (regex, param_names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthPolicy, HttpRule};
    use std::collections::HashMap as Map;

    fn service_with_rule() -> ServiceDescriptor {
        let mut auth_policies = Map::new();
        auth_policies.insert("foo.baz".to_string(), AuthPolicy::default());
        ServiceDescriptor {
            service_name: "svc".into(),
            auth_providers: vec![],
            http_rules: vec![HttpRule {
                selector: "foo.baz".into(),
                verb: HttpVerb::Get,
                url_template: "/v1/foo/{bar}/baz".into(),
            }],
            reporting_rules: Map::new(),
            auth_policies,
            quota_policies: Map::new(),
        }
    }

    #[test]
    fn matches_path_with_and_without_trailing_slash() {
        let registry = MethodRegistry::from_service(&service_with_rule());

        let m1 = registry.lookup(HttpVerb::Get, "/v1/foo/2/baz").unwrap();
        assert_eq!(m1.path_params.get("bar"), Some(&"2".to_string()));

        let m2 = registry.lookup(HttpVerb::Get, "/v1/foo/2/baz/").unwrap();
        assert_eq!(m2.path_params.get("bar"), Some(&"2".to_string()));
    }

    #[test]
    fn rejects_wrong_verb_or_unmatched_path() {
        let registry = MethodRegistry::from_service(&service_with_rule());
        assert!(registry.lookup(HttpVerb::Post, "/v1/foo/2/baz").is_none());
        assert!(registry.lookup(HttpVerb::Get, "/v1/foo/2/baz/extra").is_none());
        assert!(registry.lookup(HttpVerb::Get, "/v1/other").is_none());
    }

    #[test]
    fn returns_the_same_method_info_for_repeated_lookups() {
        let registry = MethodRegistry::from_service(&service_with_rule());
        let m1 = registry.lookup(HttpVerb::Get, "/v1/foo/2/baz").unwrap();
        let m2 = registry.lookup(HttpVerb::Get, "/v1/foo/3/baz").unwrap();
        assert!(Arc::ptr_eq(&m1.info, &m2.info));
    }
}

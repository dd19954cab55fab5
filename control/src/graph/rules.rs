//! Routing-rule enrichment
//!
//! Translating routing-rule custom resources is not done here; the graph
//! builder only needs to know which hosts a rule targets and which attributes
//! it contributes to the virtual service serving a host.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::nodes::VsNode;
use crate::keys::ObjKey;
use crate::locks::{safe_read, safe_write};

/// Attributes one rule contributes to a virtual service
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleAttributes {
    pub policy_refs: Vec<String>,
    pub application_profile: Option<String>,
}

/// Source of routing-rule attributes
pub trait RouteRuleEnricher: Send + Sync {
    /// Hosts the rule targets now; empty once the rule is gone
    fn rule_hosts(&self, rule: &ObjKey) -> Vec<String>;

    /// Rules applying to `host`, lowest precedence first
    fn rules_for_host(&self, host: &str) -> Vec<(ObjKey, RuleAttributes)>;

    /// Merge every rule for `host` into `vs`; returns the rules applied
    fn enrich(&self, host: &str, vs: &mut VsNode) -> Vec<ObjKey> {
        let rules = self.rules_for_host(host);
        let mut applied = Vec::with_capacity(rules.len());
        for (key, attrs) in rules {
            for policy in attrs.policy_refs {
                if !vs.policy_refs.contains(&policy) {
                    vs.policy_refs.push(policy);
                }
            }
            if let Some(profile) = attrs.application_profile {
                vs.application_profile = profile;
            }
            applied.push(key);
        }
        vs.policy_refs.sort();
        applied
    }
}

/// No routing rules installed
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRouteRules;

impl RouteRuleEnricher for NoRouteRules {
    fn rule_hosts(&self, _rule: &ObjKey) -> Vec<String> {
        Vec::new()
    }

    fn rules_for_host(&self, _host: &str) -> Vec<(ObjKey, RuleAttributes)> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct HostRule {
    host: String,
    attrs: RuleAttributes,
}

/// In-memory rule table keyed by rule identity
#[derive(Debug, Default)]
pub struct HostRuleTable {
    rules: RwLock<BTreeMap<ObjKey, HostRule>>,
}

impl HostRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, rule: ObjKey, host: impl Into<String>, attrs: RuleAttributes) {
        safe_write(&self.rules).insert(
            rule,
            HostRule {
                host: host.into(),
                attrs,
            },
        );
    }

    pub fn remove(&self, rule: &ObjKey) {
        safe_write(&self.rules).remove(rule);
    }
}

impl RouteRuleEnricher for HostRuleTable {
    fn rule_hosts(&self, rule: &ObjKey) -> Vec<String> {
        safe_read(&self.rules)
            .get(rule)
            .map(|r| vec![r.host.clone()])
            .unwrap_or_default()
    }

    fn rules_for_host(&self, host: &str) -> Vec<(ObjKey, RuleAttributes)> {
        safe_read(&self.rules)
            .iter()
            .filter(|(_, r)| r.host == host)
            .map(|(key, r)| (key.clone(), r.attrs.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_merges_policies_without_duplicates() {
        let table = HostRuleTable::new();
        table.upsert(
            ObjKey::new("default", "waf"),
            "foo.com",
            RuleAttributes {
                policy_refs: vec!["waf-policy".into(), "analytics".into()],
                application_profile: Some("secure-http".into()),
            },
        );
        table.upsert(
            ObjKey::new("default", "other"),
            "bar.com",
            RuleAttributes {
                policy_refs: vec!["ignored".into()],
                application_profile: None,
            },
        );

        let mut vs = VsNode::new("admin", "vs");
        vs.policy_refs.push("analytics".into());
        let applied = table.enrich("foo.com", &mut vs);

        assert_eq!(applied, vec![ObjKey::new("default", "waf")]);
        assert_eq!(vs.policy_refs, vec!["analytics", "waf-policy"]);
        assert_eq!(vs.application_profile, "secure-http");
    }

    #[test]
    fn test_rule_hosts_empty_after_removal() {
        let table = HostRuleTable::new();
        let key = ObjKey::new("default", "waf");
        table.upsert(key.clone(), "foo.com", RuleAttributes::default());
        assert_eq!(table.rule_hosts(&key), vec!["foo.com"]);

        table.remove(&key);
        assert!(table.rule_hosts(&key).is_empty());
    }

    #[test]
    fn test_no_rules_leaves_vs_untouched() {
        let mut vs = VsNode::new("admin", "vs");
        let before = vs.clone();
        assert!(NoRouteRules.enrich("foo.com", &mut vs).is_empty());
        assert_eq!(vs, before);
    }
}

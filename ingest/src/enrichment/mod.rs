//! In-place event mutators applied before mapping and flattening.
//!
//! Rules are pure with respect to the event given their injected resolver:
//! the IP rule owns a `geo` resolver function, the UA rule a parser
//! function. The actual MaxMind/UA databases live outside this crate and are
//! plugged in at wiring time; tests inject closures.

use std::sync::Arc;

use ingest_config::EnrichmentRuleConfig;
use serde_json::Value;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::types::{Event, JsonPath, ObjectMap};

/// Rule names accepted in destination `enrichment` blocks.
pub const IP_LOOKUP_RULE: &str = "ip_lookup";
pub const USER_AGENT_PARSE_RULE: &str = "user_agent_parse";

/// An in-place event mutator.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies the rule. Rules never fail the event: a value that cannot be
    /// enriched is left untouched.
    fn apply(&self, event: &mut Event);
}

impl std::fmt::Debug for dyn Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("name", &self.name()).finish()
    }
}

/// Resolver injected into [`IpLookup`]: IP string to geo object.
pub type IpResolver = Arc<dyn Fn(&str) -> Option<ObjectMap> + Send + Sync>;

/// Resolver injected into [`UserAgentParse`]: UA string to parsed object.
pub type UaResolver = Arc<dyn Fn(&str) -> Option<ObjectMap> + Send + Sync>;

/// IP address to geo data rule.
pub struct IpLookup {
    src: JsonPath,
    dst: JsonPath,
    resolver: IpResolver,
}

impl IpLookup {
    pub fn new(src: &str, dst: &str, resolver: IpResolver) -> Self {
        Self {
            src: JsonPath::parse(src),
            dst: JsonPath::parse(dst),
            resolver,
        }
    }

    /// The default rule installed for browser events:
    /// `/source_ip` into `/eventn_ctx/location`.
    pub fn default_js(resolver: IpResolver) -> Self {
        Self::new("/source_ip", "/eventn_ctx/location", resolver)
    }
}

impl Rule for IpLookup {
    fn name(&self) -> &'static str {
        IP_LOOKUP_RULE
    }

    fn apply(&self, event: &mut Event) {
        let Some(Value::String(ip)) = self.src.get(event.as_map()).cloned() else {
            return;
        };

        if let Some(geo) = (self.resolver)(&ip) {
            self.dst.set(event.as_map_mut(), Value::Object(geo));
        }
    }
}

/// User agent string to parsed structure rule.
pub struct UserAgentParse {
    src: JsonPath,
    dst: JsonPath,
    resolver: UaResolver,
}

impl UserAgentParse {
    pub fn new(src: &str, dst: &str, resolver: UaResolver) -> Self {
        Self {
            src: JsonPath::parse(src),
            dst: JsonPath::parse(dst),
            resolver,
        }
    }

    /// The default rule installed for browser events:
    /// `/eventn_ctx/user_agent` into `/eventn_ctx/parsed_ua`.
    pub fn default_js(resolver: UaResolver) -> Self {
        Self::new("/eventn_ctx/user_agent", "/eventn_ctx/parsed_ua", resolver)
    }
}

impl Rule for UserAgentParse {
    fn name(&self) -> &'static str {
        USER_AGENT_PARSE_RULE
    }

    fn apply(&self, event: &mut Event) {
        let Some(Value::String(ua)) = self.src.get(event.as_map()).cloned() else {
            return;
        };

        if let Some(parsed) = (self.resolver)(&ua) {
            self.dst.set(event.as_map_mut(), Value::Object(parsed));
        }
    }
}

/// Builds a rule from its configuration block. Unknown rule names are
/// rejected at destination init.
pub fn build_rule(
    config: &EnrichmentRuleConfig,
    ip_resolver: IpResolver,
    ua_resolver: UaResolver,
) -> IngestResult<Box<dyn Rule>> {
    match config.name.as_str() {
        IP_LOOKUP_RULE => Ok(Box::new(IpLookup::new(
            &config.from,
            &config.to,
            ip_resolver,
        ))),
        USER_AGENT_PARSE_RULE => Ok(Box::new(UserAgentParse::new(
            &config.from,
            &config.to,
            ua_resolver,
        ))),
        unknown => Err(ingest_error!(
            ErrorKind::ValidationFailed,
            "Unknown enrichment rule",
            unknown
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event::new(value.as_object().unwrap().clone())
    }

    fn geo_resolver() -> IpResolver {
        Arc::new(|ip| {
            (ip == "10.0.0.1").then(|| {
                json!({"country": "DE", "city": "Berlin"})
                    .as_object()
                    .unwrap()
                    .clone()
            })
        })
    }

    #[test]
    fn ip_rule_enriches_known_address() {
        let rule = IpLookup::default_js(geo_resolver());
        let mut e = event(json!({"source_ip": "10.0.0.1"}));
        rule.apply(&mut e);
        assert_eq!(
            JsonPath::parse("/eventn_ctx/location/country").get(e.as_map()),
            Some(&json!("DE"))
        );
    }

    #[test]
    fn ip_rule_leaves_unknown_address_untouched() {
        let rule = IpLookup::default_js(geo_resolver());
        let mut e = event(json!({"source_ip": "127.0.0.1"}));
        rule.apply(&mut e);
        assert_eq!(JsonPath::parse("/eventn_ctx/location").get(e.as_map()), None);
    }

    #[test]
    fn unknown_rule_name_is_rejected() {
        let config = EnrichmentRuleConfig {
            name: "geoip2".into(),
            from: "/ip".into(),
            to: "/geo".into(),
        };
        let err = build_rule(&config, geo_resolver(), Arc::new(|_| None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}

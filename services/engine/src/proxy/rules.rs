//! Rule predicates and the routing table.
//!
//! Rules are written in the text form `KIND,VALUE,TARGET[,no-resolve]`.
//! Logical rules nest predicates in parentheses:
//!
//! ```text
//! AND,((DOMAIN-SUFFIX,example.com),(DST-PORT,443)),proxy
//! NOT,((NETWORK,udp)),DIRECT
//! MATCH,proxy
//! ```
//!
//! Hostname predicates never trigger DNS: a connection that arrived with a
//! hostname and no literal IP simply does not match IP predicates.

use std::fmt;
use std::str::FromStr;

use switchyard_events::Network;
use switchyard_networking::{
    host_matches_suffix, normalize_hostname, normalize_suffix, IpCidr, NetworkError, PortRange,
};

use super::geoip::{matches_country, GeoIpResolver};
use super::metadata::ConnMetadata;
use super::node::NodeIndex;
use crate::error::ConfigError;

/// Condition evaluated against connection metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Domain(String),
    /// `apex` is false when the suffix was written with a leading dot, in
    /// which case only subdomains match.
    DomainSuffix { suffix: String, apex: bool },
    DomainKeyword(String),
    IpCidr(IpCidr),
    SrcIpCidr(IpCidr),
    DstPort(PortRange),
    SrcPort(PortRange),
    ProcessName(String),
    GeoIp(String),
    InTag(String),
    Network(Network),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn matches(&self, meta: &ConnMetadata, geoip: &dyn GeoIpResolver) -> bool {
        match self {
            Predicate::Domain(domain) => meta.host.as_deref() == Some(domain.as_str()),
            Predicate::DomainSuffix { suffix, apex } => meta.host.as_deref().is_some_and(|host| {
                host_matches_suffix(host, suffix) && (*apex || host != suffix)
            }),
            Predicate::DomainKeyword(keyword) => meta
                .host
                .as_deref()
                .is_some_and(|host| host.contains(keyword.as_str())),
            Predicate::IpCidr(cidr) => meta.dst_ip.is_some_and(|ip| cidr.contains(ip)),
            Predicate::SrcIpCidr(cidr) => cidr.contains(meta.source.ip()),
            Predicate::DstPort(range) => range.contains(meta.dst_port),
            Predicate::SrcPort(range) => range.contains(meta.source.port()),
            Predicate::ProcessName(name) => meta.process_name.as_deref() == Some(name.as_str()),
            Predicate::GeoIp(country) => meta
                .dst_ip
                .is_some_and(|ip| matches_country(geoip, ip, country)),
            Predicate::InTag(tag) => meta.inbound_tag == *tag,
            Predicate::Network(network) => meta.network == *network,
            Predicate::And(all) => all.iter().all(|p| p.matches(meta, geoip)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(meta, geoip)),
            Predicate::Not(inner) => !inner.matches(meta, geoip),
        }
    }

    /// Parse `KIND` and `VALUE` of a rule.
    fn parse(kind: &str, value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("empty value".to_string());
        }

        let predicate = match kind.to_ascii_uppercase().as_str() {
            "DOMAIN" => Predicate::Domain(normalize_hostname(value)),
            "DOMAIN-SUFFIX" => Predicate::DomainSuffix {
                suffix: normalize_suffix(&value.to_ascii_lowercase()).map_err(|e| e.to_string())?,
                apex: !value.starts_with('.'),
            },
            "DOMAIN-KEYWORD" => Predicate::DomainKeyword(value.to_ascii_lowercase()),
            "IP-CIDR" | "IP-CIDR6" => Predicate::IpCidr(parse_cidr(value)?),
            "SRC-IP-CIDR" => Predicate::SrcIpCidr(parse_cidr(value)?),
            "DST-PORT" => {
                Predicate::DstPort(value.parse().map_err(|e: NetworkError| e.to_string())?)
            }
            "SRC-PORT" => {
                Predicate::SrcPort(value.parse().map_err(|e: NetworkError| e.to_string())?)
            }
            "PROCESS-NAME" => Predicate::ProcessName(value.to_string()),
            "GEOIP" => Predicate::GeoIp(value.to_ascii_uppercase()),
            "IN-TAG" => Predicate::InTag(value.to_string()),
            "NETWORK" => match value.to_ascii_lowercase().as_str() {
                "tcp" => Predicate::Network(Network::Tcp),
                "udp" => Predicate::Network(Network::Udp),
                other => return Err(format!("unknown network {other:?}")),
            },
            "AND" => Predicate::And(parse_operands(value)?),
            "OR" => Predicate::Or(parse_operands(value)?),
            "NOT" => {
                let mut operands = parse_operands(value)?;
                if operands.len() != 1 {
                    return Err("NOT takes exactly one operand".to_string());
                }
                Predicate::Not(Box::new(operands.remove(0)))
            }
            "MATCH" => return Err("MATCH cannot be nested".to_string()),
            other => return Err(format!("unknown rule kind {other:?}")),
        };
        Ok(predicate)
    }
}

fn parse_cidr(value: &str) -> Result<IpCidr, String> {
    IpCidr::from_cidr(value).map_err(|e| e.to_string())
}

/// Parse `((A,a),(B,b),...)` into its operands.
fn parse_operands(value: &str) -> Result<Vec<Predicate>, String> {
    let inner = strip_parens(value)
        .ok_or_else(|| format!("expected parenthesised operands, got {value:?}"))?;
    let mut operands = Vec::new();
    for part in split_top_level(inner)? {
        let operand = strip_parens(part)
            .ok_or_else(|| format!("operand {part:?} is not parenthesised"))?;
        let fields = split_top_level(operand)?;
        match fields.as_slice() {
            [kind, value] | [kind, value, _] => operands.push(Predicate::parse(kind, value)?),
            _ => return Err(format!("operand {operand:?} is not KIND,VALUE")),
        }
    }
    if operands.is_empty() {
        return Err("logical rule has no operands".to_string());
    }
    Ok(operands)
}

fn strip_parens(s: &str) -> Option<&str> {
    s.trim().strip_prefix('(')?.strip_suffix(')')
}

/// Split on commas outside parentheses.
fn split_top_level(s: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced parentheses".to_string())?;
            }
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }
    parts.push(s[start..].trim());
    Ok(parts)
}

/// A rule as written, before its target is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSpec {
    /// `KIND,VALUE,TARGET`.
    Match { predicate: Predicate, target: String },
    /// `MATCH,TARGET`: the default target.
    Final { target: String },
}

impl RuleSpec {
    pub fn target(&self) -> &str {
        match self {
            RuleSpec::Match { target, .. } | RuleSpec::Final { target } => target,
        }
    }
}

impl FromStr for RuleSpec {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: String| ConfigError::MalformedRule {
            rule: text.to_string(),
            reason,
        };

        let parts = split_top_level(text).map_err(malformed)?;
        let kind = parts[0];

        if kind.eq_ignore_ascii_case("MATCH") {
            return match parts.as_slice() {
                [_, target] if !target.is_empty() => Ok(RuleSpec::Final {
                    target: target.to_string(),
                }),
                _ => Err(malformed("expected MATCH,TARGET".to_string())),
            };
        }

        let (value, target, options) = match parts.as_slice() {
            [_, value, target, options @ ..] => (*value, *target, options),
            _ => return Err(malformed("expected KIND,VALUE,TARGET".to_string())),
        };
        if target.is_empty() {
            return Err(malformed("empty target".to_string()));
        }
        for option in options {
            // Routing never resolves hostnames, so `no-resolve` is implied.
            if !option.eq_ignore_ascii_case("no-resolve") {
                return Err(malformed(format!("unknown option {option:?}")));
            }
        }

        let predicate = Predicate::parse(kind, value).map_err(malformed)?;
        Ok(RuleSpec::Match {
            predicate,
            target: target.to_string(),
        })
    }
}

/// What a rule sends traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Node(NodeIndex),
    /// Index into the snapshot's group list.
    Group(usize),
}

/// A rule with its target resolved.
#[derive(Debug, Clone)]
pub struct Rule {
    pub text: String,
    pub predicate: Predicate,
    pub target: Target,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Ordered rules plus a default target. Immutable once built.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<Rule>,
    default_target: Target,
}

impl RoutingTable {
    /// Parse and resolve `rules` in order.
    ///
    /// `MATCH` must be the last rule and replaces `default_target`.
    pub fn build<F>(
        rules: &[String],
        default_target: Target,
        resolve: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<Target>,
    {
        let mut table = Self {
            rules: Vec::with_capacity(rules.len()),
            default_target,
        };

        for (position, text) in rules.iter().enumerate() {
            let spec: RuleSpec = text.parse()?;
            let target = resolve(spec.target()).ok_or_else(|| ConfigError::UnknownTarget {
                rule: text.clone(),
                target: spec.target().to_string(),
            })?;

            match spec {
                RuleSpec::Match { predicate, .. } => table.rules.push(Rule {
                    text: text.clone(),
                    predicate,
                    target,
                }),
                RuleSpec::Final { .. } => {
                    if position + 1 != rules.len() {
                        return Err(ConfigError::MalformedRule {
                            rule: text.clone(),
                            reason: "MATCH must be the last rule".to_string(),
                        });
                    }
                    table.default_target = target;
                }
            }
        }

        Ok(table)
    }

    /// First rule matching `meta`, in declared order.
    pub fn first_match(&self, meta: &ConnMetadata, geoip: &dyn GeoIpResolver) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.predicate.matches(meta, geoip))
    }

    pub fn default_target(&self) -> Target {
        self.default_target
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

//! Routing Table Compiler
//!
//! Turns a declarative [`GatewayConfig`] into an immutable [`RoutingTable`].
//! Pure function of its input: no I/O, no logging of secrets, no partial
//! results. Every violation found is reported so operators can fix the
//! document in one pass.

use crate::domain::entities::{
    BackendPool, BackendSettings, CertificateRef, HealthBinding, HealthProbe, Listener,
    RoutingRule, RuleTarget, WafPolicy,
};
use crate::domain::errors::{ConfigError, ConfigViolation};
use crate::domain::gateway_config::{GatewayConfig, RuleTargetConfig};
use crate::domain::services::routing_table::RoutingTable;
use crate::domain::services::waf::{RuleSet, WafFilter};
use crate::domain::value_objects::{PathPattern, Protocol};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub struct RoutingCompiler;

impl RoutingCompiler {
    /// Compile a configuration document.
    ///
    /// # Returns
    /// The routing table, or `ConfigError::Invalid` listing every violation.
    pub fn compile(config: &GatewayConfig) -> Result<RoutingTable, ConfigError> {
        let mut violations = Vec::new();

        check_unique_names(config, &mut violations);

        let listeners = compile_listeners(config, &mut violations);
        let probes = compile_probes(config, &mut violations);
        let settings = compile_settings(config, &probes, &mut violations);
        let pools = compile_pools(config, &mut violations);
        let rules = compile_rules(config, &listeners, &pools, &settings, &mut violations);
        let health_bindings = derive_health_bindings(&rules, &settings, &mut violations);
        let waf = compile_waf(config, &mut violations);

        if !violations.is_empty() {
            return Err(ConfigError::Invalid(violations));
        }

        let Some(waf_filter) = WafFilter::from_policy(&waf) else {
            return Err(ConfigError::Invalid(vec![ConfigViolation::UnsupportedRuleSet {
                version: waf.rule_set_version,
            }]));
        };

        let mut by_listener: HashMap<String, Vec<RoutingRule>> = HashMap::new();
        for rule in rules {
            by_listener.entry(rule.listener.clone()).or_default().push(rule);
        }
        for rules in by_listener.values_mut() {
            rules.sort_by_key(|r| r.priority);
        }

        let certificates = config
            .certificates
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    CertificateRef {
                        id: c.id.clone(),
                        material_ref: c.material_ref.clone(),
                        renewal_lead_time: chrono::Duration::days(i64::from(c.renewal_lead_days)),
                    },
                )
            })
            .collect();

        Ok(RoutingTable {
            listeners,
            rules: by_listener,
            pools,
            settings,
            probes,
            health_bindings,
            waf,
            waf_filter,
            certificates,
        })
    }
}

fn check_unique_names(config: &GatewayConfig, violations: &mut Vec<ConfigViolation>) {
    fn dupes<'a>(
        kind: &'static str,
        names: impl Iterator<Item = &'a String>,
        violations: &mut Vec<ConfigViolation>,
    ) {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for name in names {
            if !seen.insert(name) && reported.insert(name) {
                violations.push(ConfigViolation::DuplicateName {
                    kind,
                    name: name.clone(),
                });
            }
        }
    }

    dupes("listener", config.listeners.iter().map(|l| &l.name), violations);
    dupes("rule", config.rules.iter().map(|r| &r.name), violations);
    dupes("backend pool", config.pools.iter().map(|p| &p.name), violations);
    dupes("backend settings", config.settings.iter().map(|s| &s.name), violations);
    dupes("probe", config.probes.iter().map(|p| &p.name), violations);
    dupes("certificate", config.certificates.iter().map(|c| &c.id), violations);
}

fn compile_listeners(
    config: &GatewayConfig,
    violations: &mut Vec<ConfigViolation>,
) -> Vec<Listener> {
    let declared_certs: HashSet<&str> = config.certificates.iter().map(|c| c.id.as_str()).collect();
    let mut bindings: HashMap<(u16, Protocol), &str> = HashMap::new();
    let mut listeners = Vec::with_capacity(config.listeners.len());

    for l in &config.listeners {
        if let Some(first) = bindings.insert((l.port, l.protocol), &l.name) {
            violations.push(ConfigViolation::DuplicateListenerBinding {
                first: first.to_string(),
                second: l.name.clone(),
                port: l.port,
                protocol: l.protocol,
            });
        }

        let certificate = match (l.protocol, l.certificate.as_deref()) {
            (Protocol::Https, None) => {
                violations.push(ConfigViolation::MissingCertificate {
                    listener: l.name.clone(),
                });
                None
            }
            (Protocol::Https, Some(id)) => {
                if !declared_certs.contains(id) {
                    violations.push(ConfigViolation::UnknownCertificate {
                        listener: l.name.clone(),
                        certificate: id.to_string(),
                    });
                }
                Some(id.to_string())
            }
            // Plaintext listeners never bind certificates
            (Protocol::Http, _) => None,
        };

        listeners.push(Listener {
            name: l.name.clone(),
            port: l.port,
            protocol: l.protocol,
            certificate,
            host_name: l.host_name.clone(),
        });
    }

    listeners
}

fn compile_probes(
    config: &GatewayConfig,
    violations: &mut Vec<ConfigViolation>,
) -> HashMap<String, HealthProbe> {
    let mut probes = HashMap::new();

    for p in &config.probes {
        let mut invalid = |reason: String| {
            violations.push(ConfigViolation::InvalidProbe {
                probe: p.name.clone(),
                reason,
            })
        };

        if !p.path.starts_with('/') {
            invalid(format!("path '{}' must start with '/'", p.path));
        }
        if p.interval_secs == 0 {
            invalid("interval must be greater than zero".to_string());
        }
        if p.timeout_secs == 0 {
            invalid("timeout must be greater than zero".to_string());
        }
        if p.unhealthy_threshold == 0 {
            invalid("unhealthy threshold must be at least 1".to_string());
        }
        if !p.status_range.is_valid() {
            invalid(format!("invalid status range {}", p.status_range));
        }

        probes.insert(
            p.name.clone(),
            HealthProbe {
                name: p.name.clone(),
                protocol: p.protocol,
                path: p.path.clone(),
                interval: Duration::from_secs(p.interval_secs),
                timeout: Duration::from_secs(p.timeout_secs),
                unhealthy_threshold: p.unhealthy_threshold,
                status_range: p.status_range,
            },
        );
    }

    probes
}

fn compile_settings(
    config: &GatewayConfig,
    probes: &HashMap<String, HealthProbe>,
    violations: &mut Vec<ConfigViolation>,
) -> HashMap<String, BackendSettings> {
    let mut settings = HashMap::new();

    for s in &config.settings {
        if !probes.contains_key(&s.probe) {
            violations.push(ConfigViolation::UnknownProbe {
                settings: s.name.clone(),
                probe: s.probe.clone(),
            });
        }
        if s.port == 0 {
            violations.push(ConfigViolation::InvalidSettings {
                settings: s.name.clone(),
                reason: "port must be greater than zero".to_string(),
            });
        }
        if s.request_timeout_secs == 0 {
            violations.push(ConfigViolation::InvalidSettings {
                settings: s.name.clone(),
                reason: "request timeout must be greater than zero".to_string(),
            });
        }

        settings.insert(
            s.name.clone(),
            BackendSettings {
                name: s.name.clone(),
                protocol: s.protocol,
                port: s.port,
                request_timeout: Duration::from_secs(s.request_timeout_secs),
                cookie_affinity: s.cookie_affinity,
                host_header: s.host_header.clone().filter(|h| !h.is_empty()),
                probe: s.probe.clone(),
            },
        );
    }

    settings
}

fn compile_pools(
    config: &GatewayConfig,
    violations: &mut Vec<ConfigViolation>,
) -> HashMap<String, BackendPool> {
    let mut pools = HashMap::new();

    for p in &config.pools {
        // Keep declaration order, drop blanks and repeats
        let mut seen = HashSet::new();
        let targets: Vec<String> = p
            .targets
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty() && seen.insert(*t))
            .map(str::to_string)
            .collect();

        if targets.is_empty() {
            violations.push(ConfigViolation::EmptyPool {
                pool: p.name.clone(),
            });
        }

        pools.insert(
            p.name.clone(),
            BackendPool {
                name: p.name.clone(),
                targets,
            },
        );
    }

    pools
}

fn compile_rules(
    config: &GatewayConfig,
    listeners: &[Listener],
    pools: &HashMap<String, BackendPool>,
    settings: &HashMap<String, BackendSettings>,
    violations: &mut Vec<ConfigViolation>,
) -> Vec<RoutingRule> {
    let listener_names: HashSet<&str> = listeners.iter().map(|l| l.name.as_str()).collect();
    let mut priorities: HashMap<(&str, u32), &str> = HashMap::new();
    let mut catch_alls: HashMap<&str, usize> = HashMap::new();
    let mut rules = Vec::with_capacity(config.rules.len());

    for r in &config.rules {
        let known_listener = listener_names.contains(r.listener.as_str());
        if !known_listener {
            violations.push(ConfigViolation::UnknownListener {
                rule: r.name.clone(),
                listener: r.listener.clone(),
            });
        }

        if let Some(first) = priorities.insert((r.listener.as_str(), r.priority), &r.name) {
            violations.push(ConfigViolation::DuplicatePriority {
                listener: r.listener.clone(),
                first: first.to_string(),
                second: r.name.clone(),
                priority: r.priority,
            });
        }

        let target = match &r.target {
            RuleTargetConfig::Backend {
                pool,
                settings: settings_name,
            } => {
                if !pools.contains_key(pool) {
                    violations.push(ConfigViolation::UnknownPool {
                        rule: r.name.clone(),
                        pool: pool.clone(),
                    });
                }
                if !settings.contains_key(settings_name) {
                    violations.push(ConfigViolation::UnknownSettings {
                        rule: r.name.clone(),
                        settings: settings_name.clone(),
                    });
                }
                RuleTarget::Backend {
                    pool: pool.clone(),
                    settings: settings_name.clone(),
                }
            }
            RuleTargetConfig::Redirect { listener } => {
                if !listener_names.contains(listener.as_str()) {
                    violations.push(ConfigViolation::UnknownRedirectListener {
                        rule: r.name.clone(),
                        listener: listener.clone(),
                    });
                } else if *listener == r.listener {
                    violations.push(ConfigViolation::RedirectLoop {
                        rule: r.name.clone(),
                        listener: listener.clone(),
                    });
                }
                RuleTarget::Redirect {
                    listener: listener.clone(),
                }
            }
        };

        let path = match PathPattern::parse(&r.path) {
            Ok(path) => path,
            Err(reason) => {
                violations.push(ConfigViolation::InvalidPathPattern {
                    rule: r.name.clone(),
                    reason,
                });
                continue;
            }
        };

        if path.is_catch_all() {
            *catch_alls.entry(r.listener.as_str()).or_default() += 1;
        }

        rules.push(RoutingRule {
            name: r.name.clone(),
            listener: r.listener.clone(),
            priority: r.priority,
            path,
            target,
        });
    }

    for listener in listeners {
        match catch_alls.get(listener.name.as_str()).copied().unwrap_or(0) {
            0 => violations.push(ConfigViolation::MissingDefaultRule {
                listener: listener.name.clone(),
            }),
            1 => {}
            count => violations.push(ConfigViolation::MultipleDefaultRules {
                listener: listener.name.clone(),
                count,
            }),
        }
    }

    rules
}

/// One binding per pool. Two rules reaching the same pool through settings
/// that disagree on how to probe it would give the pool two writers.
fn derive_health_bindings(
    rules: &[RoutingRule],
    settings: &HashMap<String, BackendSettings>,
    violations: &mut Vec<ConfigViolation>,
) -> Vec<HealthBinding> {
    let mut by_pool: HashMap<&str, (HealthBinding, &str)> = HashMap::new();
    let mut order = Vec::new();
    let mut reported = HashSet::new();

    for rule in rules {
        let RuleTarget::Backend {
            pool,
            settings: settings_name,
        } = &rule.target
        else {
            continue;
        };
        let Some(s) = settings.get(settings_name) else {
            continue;
        };

        let binding = HealthBinding {
            pool: pool.clone(),
            probe: s.probe.clone(),
            port: s.port,
            protocol: s.protocol,
            host_header: s.host_header.clone(),
        };

        match by_pool.get(pool.as_str()) {
            None => {
                order.push(pool.as_str());
                by_pool.insert(pool.as_str(), (binding, settings_name.as_str()));
            }
            Some((existing, first)) if *existing != binding => {
                if reported.insert((pool.as_str(), settings_name.as_str())) {
                    violations.push(ConfigViolation::ConflictingHealthBinding {
                        pool: pool.clone(),
                        first: first.to_string(),
                        second: settings_name.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|pool| by_pool.remove(pool).map(|(binding, _)| binding))
        .collect()
}

fn compile_waf(config: &GatewayConfig, violations: &mut Vec<ConfigViolation>) -> WafPolicy {
    let waf = &config.waf;

    if !RuleSet::is_supported(&waf.rule_set_version) {
        violations.push(ConfigViolation::UnsupportedRuleSet {
            version: waf.rule_set_version.clone(),
        });
    }
    if waf.max_request_body_bytes == 0 {
        violations.push(ConfigViolation::InvalidWafPolicy {
            reason: "max request body size must be greater than zero".to_string(),
        });
    }
    if waf.file_upload_limit_bytes == 0 {
        violations.push(ConfigViolation::InvalidWafPolicy {
            reason: "file upload limit must be greater than zero".to_string(),
        });
    }

    WafPolicy {
        mode: waf.mode,
        rule_set_version: waf.rule_set_version.clone(),
        max_request_body_bytes: waf.max_request_body_bytes,
        file_upload_limit_bytes: waf.file_upload_limit_bytes,
        inspect_body: waf.inspect_body,
    }
}

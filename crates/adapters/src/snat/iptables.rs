use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use domain::snat::entity::{SnatRule, SnatRuleKey};
use domain::snat::error::SnatError;
use ports::secondary::snat_rule_port::SnatRulePort;
use tracing::{error, info};

use super::SNAT_CHAIN;

const NAT_TABLE: &str = "nat";
const POSTROUTING: &str = "POSTROUTING";

/// Source-rewrite rules in a dedicated iptables chain.
///
/// Drives the `iptables` / `ip6tables` binaries (chosen per backend address
/// family) and keeps its own managed-rule map, so reconcile only ever deletes
/// rules it installed itself.
#[derive(Debug, Default)]
pub struct IptablesSnatRules {
    managed: Mutex<HashMap<SnatRuleKey, SnatRule>>,
}

fn binary_for(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "iptables",
        IpAddr::V6(_) => "ip6tables",
    }
}

fn run(program: &str, args: &[&str]) -> Result<(), SnatError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SnatError::Exec {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(SnatError::CommandFailed {
            program: program.to_string(),
            args: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn rule_exists(program: &str, args: &[&str]) -> bool {
    run(program, args).is_ok()
}

fn rule_spec(rule: &SnatRule) -> Vec<String> {
    let mut spec = vec![
        "-d".to_string(),
        rule.backend_ip.to_string(),
        "-p".to_string(),
        rule.protocol.as_str().to_string(),
        "--dport".to_string(),
        rule.backend_port.to_string(),
    ];
    match rule.snat_ip {
        Some(snat_ip) => {
            spec.push("-j".to_string());
            spec.push("SNAT".to_string());
            spec.push("--to-source".to_string());
            spec.push(snat_ip.to_string());
        }
        None => {
            spec.push("-j".to_string());
            spec.push("MASQUERADE".to_string());
        }
    }
    spec
}

fn with_prefix<'a>(prefix: &[&'a str], spec: &'a [String]) -> Vec<&'a str> {
    let mut args: Vec<&str> = prefix.to_vec();
    args.extend(spec.iter().map(String::as_str));
    args
}

fn add_rule(rule: &SnatRule) -> Result<(), SnatError> {
    let program = binary_for(rule.backend_ip);
    let spec = rule_spec(rule);
    let check = with_prefix(&["-t", NAT_TABLE, "-C", SNAT_CHAIN], &spec);
    if rule_exists(program, &check) {
        return Ok(());
    }
    run(program, &with_prefix(&["-t", NAT_TABLE, "-A", SNAT_CHAIN], &spec))
}

fn delete_rule(rule: &SnatRule) -> Result<(), SnatError> {
    let program = binary_for(rule.backend_ip);
    let spec = rule_spec(rule);
    let check = with_prefix(&["-t", NAT_TABLE, "-C", SNAT_CHAIN], &spec);
    if !rule_exists(program, &check) {
        return Ok(());
    }
    run(program, &with_prefix(&["-t", NAT_TABLE, "-D", SNAT_CHAIN], &spec))
}

fn ensure_chain_for(program: &str) -> Result<(), SnatError> {
    if !rule_exists(program, &["-t", NAT_TABLE, "-nL", SNAT_CHAIN]) {
        run(program, &["-t", NAT_TABLE, "-N", SNAT_CHAIN])?;
        info!(program, chain = SNAT_CHAIN, "created snat chain");
    }
    if !rule_exists(program, &["-t", NAT_TABLE, "-C", POSTROUTING, "-j", SNAT_CHAIN]) {
        run(program, &["-t", NAT_TABLE, "-A", POSTROUTING, "-j", SNAT_CHAIN])?;
    }
    Ok(())
}

fn remove_chain_for(program: &str) -> Result<(), SnatError> {
    if !rule_exists(program, &["-t", NAT_TABLE, "-nL", SNAT_CHAIN]) {
        return Ok(());
    }
    run(program, &["-t", NAT_TABLE, "-F", SNAT_CHAIN])?;
    if rule_exists(program, &["-t", NAT_TABLE, "-C", POSTROUTING, "-j", SNAT_CHAIN]) {
        run(program, &["-t", NAT_TABLE, "-D", POSTROUTING, "-j", SNAT_CHAIN])?;
    }
    run(program, &["-t", NAT_TABLE, "-X", SNAT_CHAIN])
}

impl IptablesSnatRules {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SnatRuleKey, SnatRule>> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnatRulePort for IptablesSnatRules {
    fn ensure_chain(&self) -> Result<(), SnatError> {
        ensure_chain_for("iptables")?;
        ensure_chain_for("ip6tables")
    }

    fn reconcile(&self, desired: &[SnatRule]) -> Result<(), SnatError> {
        let mut managed = self.lock();

        let desired_map: HashMap<SnatRuleKey, SnatRule> =
            desired.iter().map(|r| (r.key(), *r)).collect();

        let mut failed = 0usize;

        let stale: Vec<SnatRule> = managed
            .iter()
            .filter(|(key, _)| !desired_map.contains_key(key))
            .map(|(_, rule)| *rule)
            .collect();
        for rule in stale {
            match delete_rule(&rule) {
                Ok(()) => {
                    managed.remove(&rule.key());
                    info!(rule = %rule.key(), "deleted snat rule");
                }
                Err(e) => {
                    failed += 1;
                    error!(rule = %rule.key(), error = %e, "failed to delete snat rule");
                }
            }
        }

        for (key, rule) in desired_map {
            if let Some(existing) = managed.get(&key) {
                if existing.snat_ip == rule.snat_ip {
                    continue;
                }
                // The rule text encodes the source address; replace, don't update.
                if let Err(e) = delete_rule(existing) {
                    failed += 1;
                    error!(rule = %key, error = %e, "failed to delete outdated snat rule");
                    continue;
                }
                managed.remove(&key);
            }
            match add_rule(&rule) {
                Ok(()) => {
                    managed.insert(key, rule);
                    info!(rule = %key, snat_ip = ?rule.snat_ip, "added snat rule");
                }
                Err(e) => {
                    failed += 1;
                    error!(rule = %key, error = %e, "failed to add snat rule");
                }
            }
        }

        if failed > 0 {
            return Err(SnatError::Partial(failed));
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<(), SnatError> {
        remove_chain_for("iptables")?;
        remove_chain_for("ip6tables")?;
        self.lock().clear();
        info!(chain = SNAT_CHAIN, "removed snat chain");
        Ok(())
    }
}

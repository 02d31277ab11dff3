use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use domain::snat::entity::{SnatRule, SnatRuleKey};
use domain::snat::error::SnatError;
use ports::secondary::snat_rule_port::SnatRulePort;
use tracing::debug;

/// In-memory source-rewrite rule manager.
///
/// Applies the same delta semantics as the iptables binding: stale rules are
/// removed, missing ones added, and a changed `snat_ip` replaces the rule.
#[derive(Debug, Default)]
pub struct MemorySnatRules {
    managed: Mutex<HashMap<SnatRuleKey, SnatRule>>,
}

impl MemorySnatRules {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SnatRuleKey, SnatRule>> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the currently managed rules.
    pub fn managed(&self) -> HashMap<SnatRuleKey, SnatRule> {
        self.lock().clone()
    }
}

impl SnatRulePort for MemorySnatRules {
    fn ensure_chain(&self) -> Result<(), SnatError> {
        Ok(())
    }

    fn reconcile(&self, desired: &[SnatRule]) -> Result<(), SnatError> {
        let mut managed = self.lock();

        let desired_map: HashMap<SnatRuleKey, SnatRule> =
            desired.iter().map(|r| (r.key(), *r)).collect();

        managed.retain(|key, _| {
            let keep = desired_map.contains_key(key);
            if !keep {
                debug!(rule = %key, "removed snat rule");
            }
            keep
        });

        for (key, rule) in desired_map {
            match managed.get(&key) {
                Some(existing) if existing.snat_ip == rule.snat_ip => {}
                _ => {
                    managed.insert(key, rule);
                    debug!(rule = %key, "installed snat rule");
                }
            }
        }

        Ok(())
    }

    fn cleanup(&self) -> Result<(), SnatError> {
        self.lock().clear();
        Ok(())
    }
}

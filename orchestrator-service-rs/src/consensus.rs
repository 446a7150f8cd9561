//! # Consensus Builder
//!
//! Folds per-agent findings into one ranked diagnosis.
//!
//! 1. Findings under the confidence floor are set aside.
//! 2. The rest are clustered greedily, in registration order, by token
//!    similarity against each cluster's first member.
//! 3. The cluster with the most members is primary; ties go to the cluster
//!    that contains the earlier registered agent.
//! 4. Confidence is the authority-weighted mean of the primary cluster,
//!    scaled by `1 - penalty * (1 - agreement)` where agreement is the
//!    primary cluster's share of the weighted confidence mass.
//! 5. Flags at or above the red-flag severity are surfaced from every
//!    successful finding, including those under the floor.
//!
//! The output depends only on the ordered input and the configuration.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use config_rs::ConsensusConfig;
use error_handling::{Error, Result};
use shared_types::{
    AgentFinding, ConsensusResult, DegradedAgent, Fingerprint, FlagSeverity, Priority, RankedDiagnosis, RedFlag,
};
use tracing::debug;

/// Everything the builder needs for one orchestration
#[derive(Debug, Clone)]
pub struct ConsensusInput {
    pub fingerprint: Fingerprint,
    pub tenant_id: String,
    pub priority: Priority,
    /// Successful findings with their authority weights, in registration order
    pub findings: Vec<(AgentFinding, f64)>,
    pub degraded: Vec<DegradedAgent>,
}

#[derive(Debug, Clone)]
pub struct ConsensusBuilder {
    confidence_floor: f64,
    similarity_threshold: f64,
    red_flag_severity: FlagSeverity,
    disagreement_penalty: f64,
}

struct Cluster {
    members: Vec<usize>,
}

impl ConsensusBuilder {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            confidence_floor: config.confidence_floor,
            similarity_threshold: config.similarity_threshold,
            red_flag_severity: config.red_flag_severity,
            disagreement_penalty: config.disagreement_penalty,
        }
    }

    pub fn build(&self, input: ConsensusInput) -> Result<ConsensusResult> {
        self.build_at(input, Utc::now())
    }

    /// Builds with an explicit generation time
    pub fn build_at(&self, input: ConsensusInput, generated_at: DateTime<Utc>) -> Result<ConsensusResult> {
        let red_flags = self.red_flags(&input.findings);

        let accepted: Vec<(AgentFinding, f64)> = input
            .findings
            .into_iter()
            .filter(|(finding, _)| finding.confidence >= self.confidence_floor)
            .collect();

        if accepted.is_empty() {
            return Err(Error::InsufficientConsensus {
                fingerprint: input.fingerprint.to_string(),
                tenant: input.tenant_id,
                succeeded: 0,
                required: 1,
            });
        }

        let mut clusters = self.cluster(&accepted);
        // Stable: equal-sized clusters keep creation order, which is registration order
        clusters.sort_by(|a, b| b.members.len().cmp(&a.members.len()));

        let mass = |members: &[usize]| -> f64 {
            members
                .iter()
                .map(|&i| accepted[i].1 * accepted[i].0.confidence)
                .sum()
        };
        let weighted_mean = |members: &[usize]| -> f64 {
            let weight: f64 = members.iter().map(|&i| accepted[i].1).sum();
            if weight > 0.0 {
                mass(members) / weight
            } else {
                0.0
            }
        };

        let primary = &clusters[0];
        let total_mass: f64 = clusters.iter().map(|c| mass(&c.members)).sum();
        let agreement = if total_mass > 0.0 {
            mass(&primary.members) / total_mass
        } else {
            1.0
        };
        let confidence =
            (weighted_mean(&primary.members) * (1.0 - self.disagreement_penalty * (1.0 - agreement))).clamp(0.0, 1.0);

        let ranked: Vec<RankedDiagnosis> = clusters
            .iter()
            .map(|cluster| RankedDiagnosis {
                diagnosis: accepted[cluster.members[0]].0.diagnosis.clone(),
                agents: cluster
                    .members
                    .iter()
                    .map(|&i| accepted[i].0.agent.clone())
                    .collect(),
                confidence: weighted_mean(&cluster.members),
            })
            .collect();

        let mut seen = HashSet::new();
        let recommendations: Vec<String> = accepted
            .iter()
            .flat_map(|(finding, _)| finding.recommendations.iter())
            .filter(|r| seen.insert(r.as_str()))
            .cloned()
            .collect();

        let escalation_required = !red_flags.is_empty() || input.priority == Priority::Critical;

        debug!(
            fingerprint = %input.fingerprint.short(),
            clusters = ranked.len(),
            agreement,
            confidence,
            red_flags = red_flags.len(),
            "Consensus built"
        );

        Ok(ConsensusResult {
            fingerprint: input.fingerprint,
            tenant_id: input.tenant_id,
            diagnosis: ranked[0].diagnosis.clone(),
            confidence,
            ranked,
            findings: accepted.into_iter().map(|(finding, _)| finding).collect(),
            red_flags,
            recommendations,
            degraded: input.degraded,
            escalation_required,
            generated_at,
        })
    }

    fn red_flags(&self, findings: &[(AgentFinding, f64)]) -> Vec<RedFlag> {
        findings
            .iter()
            .flat_map(|(finding, _)| {
                finding
                    .flags
                    .iter()
                    .filter(|flag| flag.severity >= self.red_flag_severity)
                    .map(|flag| RedFlag {
                        agent: finding.agent.clone(),
                        severity: flag.severity,
                        message: flag.message.clone(),
                    })
            })
            .collect()
    }

    fn cluster(&self, findings: &[(AgentFinding, f64)]) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        for (index, (finding, _)) in findings.iter().enumerate() {
            let home = clusters.iter_mut().find(|cluster| {
                let representative = &findings[cluster.members[0]].0.diagnosis;
                similarity(representative, &finding.diagnosis) >= self.similarity_threshold
            });
            match home {
                Some(cluster) => cluster.members.push(index),
                None => clusters.push(Cluster { members: vec![index] }),
            }
        }
        clusters
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of the diagnoses' word sets, in `[0, 1]`
pub fn similarity(a: &str, b: &str) -> f64 {
    let (left, right) = (tokens(a), tokens(b));
    if left.is_empty() && right.is_empty() {
        return if a.trim().eq_ignore_ascii_case(b.trim()) { 1.0 } else { 0.0 };
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Capability;

    fn builder() -> ConsensusBuilder {
        ConsensusBuilder::new(&ConsensusConfig::default())
    }

    fn finding(agent: &str, diagnosis: &str, confidence: f64) -> AgentFinding {
        AgentFinding::new(agent, Capability::InfrastructureAnalysis, diagnosis, confidence)
    }

    fn input(findings: Vec<AgentFinding>) -> ConsensusInput {
        ConsensusInput {
            fingerprint: Fingerprint::from_hex("feedface"),
            tenant_id: "acme".to_string(),
            priority: Priority::Medium,
            findings: findings.into_iter().map(|f| (f, 1.0)).collect(),
            degraded: Vec::new(),
        }
    }

    fn dns_scenario() -> Vec<AgentFinding> {
        vec![
            finding("infra", "DNS forwarder misconfiguration", 0.9),
            finding("directory", "DNS forwarder misconfiguration on DC01", 0.85),
            finding("security", "Expired TLS certificate on proxy", 0.2),
        ]
    }

    #[test]
    fn test_partial_agreement_discounts_confidence() {
        let result = builder().build(input(dns_scenario())).unwrap();

        assert_eq!(result.diagnosis, "DNS forwarder misconfiguration");
        assert!(result.confidence > 0.85 && result.confidence < 0.9, "got {}", result.confidence);
        assert_eq!(result.ranked.len(), 2);
        assert_eq!(result.ranked[0].agents, vec!["infra", "directory"]);
        assert!(result.red_flags.is_empty());
        assert!(!result.escalation_required);
    }

    #[test]
    fn test_identical_input_is_deterministic() {
        let at = Utc::now();
        let first = builder().build_at(input(dns_scenario()), at).unwrap();
        let second = builder().build_at(input(dns_scenario()), at).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_more_agreement_never_lowers_confidence() {
        let split = builder()
            .build(input(vec![
                finding("a", "DNS forwarder misconfiguration", 0.8),
                finding("b", "Kerberos clock skew", 0.8),
            ]))
            .unwrap();
        let agreed = builder()
            .build(input(vec![
                finding("a", "DNS forwarder misconfiguration", 0.8),
                finding("b", "DNS forwarder misconfiguration", 0.8),
            ]))
            .unwrap();

        assert!(agreed.confidence >= split.confidence);
        assert!((agreed.confidence - 0.8).abs() < 1e-9);
        // Equal-sized clusters: the earlier registered agent wins
        assert_eq!(split.diagnosis, "DNS forwarder misconfiguration");
    }

    #[test]
    fn test_red_flag_from_finding_below_floor() {
        let mut findings = dns_scenario();
        findings.push(
            finding("compliance", "Unclear", 0.05).with_flag(FlagSeverity::Critical, "Cardholder data exposed"),
        );
        findings[0] = findings[0].clone().with_flag(FlagSeverity::Low, "Minor drift");

        let result = builder().build(input(findings)).unwrap();
        assert_eq!(result.red_flags.len(), 1);
        assert_eq!(result.red_flags[0].agent, "compliance");
        assert!(result.escalation_required);
        assert_eq!(result.findings.len(), 3);
    }

    #[test]
    fn test_authority_weights_shift_confidence() {
        let mut weighted = input(vec![
            finding("a", "DNS forwarder misconfiguration", 0.9),
            finding("b", "DNS forwarder misconfiguration", 0.5),
        ]);
        weighted.findings[0].1 = 3.0;

        let result = builder().build(weighted).unwrap();
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_critical_priority_escalates_and_recommendations_dedupe() {
        let mut request = input(vec![
            finding("a", "DNS forwarder misconfiguration", 0.9).with_recommendation("Check forwarders"),
            finding("b", "DNS forwarder misconfiguration", 0.7)
                .with_recommendation("Check forwarders")
                .with_recommendation("Flush resolver cache"),
        ]);
        request.priority = Priority::Critical;

        let result = builder().build(request).unwrap();
        assert!(result.escalation_required);
        assert_eq!(result.recommendations, vec!["Check forwarders", "Flush resolver cache"]);
    }

    #[test]
    fn test_nothing_above_floor_is_insufficient() {
        let err = builder()
            .build(input(vec![finding("a", "Unknown", 0.01)]))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientConsensus { succeeded: 0, .. }));
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("DNS forwarder misconfiguration", "dns  FORWARDER misconfiguration"), 1.0);
        assert!(similarity("DNS forwarder misconfiguration", "DNS forwarder misconfiguration on DC01") >= 0.5);
        assert_eq!(similarity("DNS forwarder misconfiguration", "Expired TLS certificate"), 0.0);
    }
}

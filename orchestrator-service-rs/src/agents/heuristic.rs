// Offline keyword-driven analysis agents.
//
// Each agent scores the issue text against a small rule table for its
// capability. The best-matching rule becomes the diagnosis; with no match the
// agent answers with a low-confidence generic triage finding.

use async_trait::async_trait;
use error_handling::Result;
use shared_types::{AgentFinding, Capability, DiagnosticRequest, FlagSeverity};

use super::AnalysisAgent;

const PROVIDER: &str = "heuristic_provider";

const INCIDENT_MARKERS: &[&str] = &["password", "unauthorized", "unauthorised"];

struct Rule {
    keywords: &'static [&'static str],
    diagnosis: &'static str,
    recommendation: &'static str,
}

const INFRASTRUCTURE_RULES: &[Rule] = &[
    Rule {
        keywords: &["dns", "resolve", "resolution", "nslookup", "forwarder", "nxdomain"],
        diagnosis: "DNS resolution failure on the internal resolvers",
        recommendation: "Verify DNS forwarder configuration and zone records",
    },
    Rule {
        keywords: &["dhcp", "lease", "apipa", "169.254", "scope"],
        diagnosis: "DHCP scope exhaustion or lease failure",
        recommendation: "Check DHCP scope utilization and relay agent configuration",
    },
    Rule {
        keywords: &["route", "routing", "gateway", "unreachable", "traceroute", "bgp", "ospf"],
        diagnosis: "Routing misconfiguration between network segments",
        recommendation: "Review routing tables and default gateway settings",
    },
    Rule {
        keywords: &["latency", "packet", "loss", "slow", "jitter", "bandwidth"],
        diagnosis: "Network congestion causing latency and packet loss",
        recommendation: "Inspect interface utilization and QoS policies",
    },
];

const SECURITY_RULES: &[Rule] = &[
    Rule {
        keywords: &["password", "credential", "brute", "lockout", "spray"],
        diagnosis: "Credential compromise or brute-force attempt",
        recommendation: "Force credential rotation and review failed sign-in logs",
    },
    Rule {
        keywords: &["unauthorized", "unauthorised", "privilege", "escalation", "intrusion"],
        diagnosis: "Unauthorized access to protected resources",
        recommendation: "Audit recent privilege changes and isolate affected accounts",
    },
    Rule {
        keywords: &["malware", "virus", "ransomware", "trojan", "phishing"],
        diagnosis: "Malware infection on an endpoint",
        recommendation: "Isolate the endpoint and run a full antimalware scan",
    },
];

const DIRECTORY_RULES: &[Rule] = &[
    Rule {
        keywords: &["kerberos", "ticket", "kdc", "clock", "skew", "spn"],
        diagnosis: "Kerberos authentication failure",
        recommendation: "Check time synchronization and service principal names",
    },
    Rule {
        keywords: &["ldap", "bind", "directory", "schema"],
        diagnosis: "LDAP bind or directory query failure",
        recommendation: "Validate LDAP bind credentials and directory service health",
    },
    Rule {
        keywords: &["replication", "domain", "controller", "sysvol", "tombstone"],
        diagnosis: "Directory replication failure between domain controllers",
        recommendation: "Run replication diagnostics and verify site link connectivity",
    },
    Rule {
        keywords: &["login", "logon", "sign-in", "authentication", "password"],
        diagnosis: "User authentication failure against the directory",
        recommendation: "Verify account status and domain controller reachability",
    },
];

const COMPLIANCE_RULES: &[Rule] = &[
    Rule {
        keywords: &["audit", "logging", "trail"],
        diagnosis: "Audit logging gap",
        recommendation: "Confirm audit policy is applied and logs are forwarded",
    },
    Rule {
        keywords: &["retention", "backup", "archive", "deletion"],
        diagnosis: "Data retention policy violation",
        recommendation: "Review retention schedules against policy requirements",
    },
    Rule {
        keywords: &["pci", "cardholder", "hipaa", "phi", "gdpr", "encryption"],
        diagnosis: "Regulated data handling outside compliance controls",
        recommendation: "Engage the compliance team and scope affected regulated data",
    },
];

pub struct HeuristicAgent {
    name: String,
    capability: Capability,
    rules: &'static [Rule],
}

impl HeuristicAgent {
    pub fn infrastructure() -> Self {
        Self::new("infrastructure-analyst", Capability::InfrastructureAnalysis, INFRASTRUCTURE_RULES)
    }

    pub fn security() -> Self {
        Self::new("security-auditor", Capability::SecurityAudit, SECURITY_RULES)
    }

    pub fn directory_and_auth() -> Self {
        Self::new("directory-analyst", Capability::DirectoryAndAuthAnalysis, DIRECTORY_RULES)
    }

    pub fn compliance() -> Self {
        Self::new("compliance-checker", Capability::ComplianceCheck, COMPLIANCE_RULES)
    }

    /// One agent per capability, in canonical capability order
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::infrastructure(),
            Self::security(),
            Self::directory_and_auth(),
            Self::compliance(),
        ]
    }

    fn new(name: &str, capability: Capability, rules: &'static [Rule]) -> Self {
        Self {
            name: name.to_string(),
            capability,
            rules,
        }
    }

    fn evaluate(&self, request: &DiagnosticRequest) -> AgentFinding {
        let text = searchable_text(request);

        let best = self
            .rules
            .iter()
            .map(|rule| {
                let matched: Vec<&str> = rule
                    .keywords
                    .iter()
                    .copied()
                    .filter(|keyword| text.contains(keyword))
                    .collect();
                (rule, matched)
            })
            .filter(|(_, matched)| !matched.is_empty())
            // First rule wins ties
            .fold(None::<(&Rule, Vec<&str>)>, |best, candidate| match best {
                Some(current) if current.1.len() >= candidate.1.len() => Some(current),
                _ => Some(candidate),
            });

        let mut finding = match best {
            Some((rule, matched)) => {
                let confidence = (0.45 + 0.15 * matched.len() as f64).min(0.95);
                let mut finding = AgentFinding::new(&self.name, self.capability, rule.diagnosis, confidence)
                    .with_recommendation(rule.recommendation);
                for keyword in matched {
                    finding = finding.with_evidence(format!("issue mentions '{}'", keyword));
                }
                finding
            }
            None => AgentFinding::new(
                &self.name,
                self.capability,
                format!("No {} indicators found", self.capability),
                0.15,
            ),
        };

        if INCIDENT_MARKERS.iter().any(|marker| text.contains(marker)) {
            finding = finding.with_flag(FlagSeverity::High, "Potential security incident");
        }
        finding
    }
}

fn searchable_text(request: &DiagnosticRequest) -> String {
    let mut text = request.issue.to_lowercase();
    for (key, value) in &request.context {
        text.push(' ');
        text.push_str(&key.to_lowercase());
        text.push(' ');
        match value.as_str() {
            Some(s) => text.push_str(&s.to_lowercase()),
            None => text.push_str(&value.to_string().to_lowercase()),
        }
    }
    text
}

#[async_trait]
impl AnalysisAgent for HeuristicAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn dependency(&self) -> &str {
        PROVIDER
    }

    async fn analyze(&self, request: &DiagnosticRequest) -> Result<AgentFinding> {
        Ok(self.evaluate(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_infrastructure_rules() {
        let agent = HeuristicAgent::infrastructure();
        let request = DiagnosticRequest::new("acme", "Users report DNS resolution failures through the forwarder");

        let finding = agent.analyze(&request).await.unwrap();
        assert_eq!(finding.diagnosis, "DNS resolution failure on the internal resolvers");
        assert_eq!(finding.evidence.len(), 3);
        assert!(finding.confidence > 0.8);
        assert!(finding.flags.is_empty());
    }

    #[tokio::test]
    async fn test_password_issue_is_flagged() {
        let agent = HeuristicAgent::compliance();
        let request = DiagnosticRequest::new("acme", "Password resets failing for all users");

        let finding = agent.analyze(&request).await.unwrap();
        assert_eq!(finding.confidence, 0.15);
        assert_eq!(finding.max_severity(), Some(FlagSeverity::High));
    }

    #[tokio::test]
    async fn test_context_is_searched() {
        let agent = HeuristicAgent::directory_and_auth();
        let request = DiagnosticRequest::new("acme", "Users cannot reach file shares")
            .with_context("event", serde_json::json!("KDC reports clock skew too great"));

        let finding = agent.analyze(&request).await.unwrap();
        assert_eq!(finding.diagnosis, "Kerberos authentication failure");
    }

    #[test]
    fn test_builtin_covers_every_capability() {
        let capabilities: Vec<Capability> = HeuristicAgent::builtin().iter().map(|a| a.capability()).collect();
        assert_eq!(capabilities, Capability::ALL.to_vec());
    }
}

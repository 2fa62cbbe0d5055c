//! Tier Policy (C3) — a pure, side-effect-free lookup table.
//!
//! `policy_for` never fails: unknown tier names fall back to `free`. The
//! ordering invariant (resource limits and durations monotone non-decreasing
//! across free < basic < pro < enterprise) is enforced by tests, not by
//! construction, since it's a property of the table's authored values.

use previewd_provider::{CheckKind, CheckSpec, CpuKind, MachineSpec};

use crate::session::TierName;

/// CPU/memory/disk resource envelope.
#[derive(Debug, Clone, Copy)]
pub struct Resources {
    pub cpu_kind: CpuKind,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_gb: Option<u32>,
}

/// Container hardening policy.
#[derive(Debug, Clone)]
pub struct Security {
    pub allowed_ports: Vec<u16>,
    pub drop_capabilities: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
    pub seccomp_profile: Option<String>,
}

/// Per-resource quota limits (spec §3 `quotas`).
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub requests_per_window: u64,
    pub window_seconds: u64,
    pub burst: Option<u64>,
    pub tokens: Option<u64>,
    pub concurrent: Option<u64>,
}

/// The quota-governed resources a tier carries limits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaResource {
    SessionCreate,
    CodeGeneration,
    QualityAnalysis,
}

impl QuotaResource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreate => "session_create",
            Self::CodeGeneration => "code_generation",
            Self::QualityAnalysis => "quality_analysis",
        }
    }
}

/// An immutable, compiled-in tier policy record (spec §3).
#[derive(Debug, Clone)]
pub struct Tier {
    pub name: TierName,
    pub resources: Resources,
    pub security: Security,
    pub max_duration_hours: u32,
    pub quotas: Vec<(QuotaResource, QuotaLimits)>,
}

impl Tier {
    #[must_use]
    pub fn quota_for(&self, resource: QuotaResource) -> Option<QuotaLimits> {
        self.quotas
            .iter()
            .find(|(r, _)| *r == resource)
            .map(|(_, limits)| *limits)
    }
}

/// Upper envelopes for `validate_limits`, distinct from any tier's concrete
/// numbers (spec §9 open question — these are extensibility ceilings, not a
/// tier default).
pub const MAX_VALIDATABLE_CPUS: u32 = 8;
pub const MAX_VALIDATABLE_MEMORY_MB: u32 = 4096;
pub const MAX_VALIDATABLE_DISK_GB: u32 = 10;

fn free() -> Tier {
    Tier {
        name: TierName::Free,
        resources: Resources {
            cpu_kind: CpuKind::Shared,
            cpus: 1,
            memory_mb: 512,
            disk_gb: None,
        },
        security: Security {
            allowed_ports: vec![8080],
            drop_capabilities: vec!["ALL".to_owned()],
            no_new_privileges: true,
            read_only_rootfs: true,
            seccomp_profile: Some("default".to_owned()),
        },
        max_duration_hours: 2,
        quotas: vec![
            (
                QuotaResource::SessionCreate,
                QuotaLimits {
                    requests_per_window: 5,
                    window_seconds: 3600,
                    burst: Some(2),
                    tokens: None,
                    concurrent: Some(1),
                },
            ),
            (
                QuotaResource::CodeGeneration,
                QuotaLimits {
                    requests_per_window: 20,
                    window_seconds: 3600,
                    burst: Some(5),
                    tokens: Some(20),
                    concurrent: None,
                },
            ),
            (
                QuotaResource::QualityAnalysis,
                QuotaLimits {
                    requests_per_window: 10,
                    window_seconds: 3600,
                    burst: Some(3),
                    tokens: None,
                    concurrent: None,
                },
            ),
        ],
    }
}

fn basic() -> Tier {
    Tier {
        name: TierName::Basic,
        resources: Resources {
            cpu_kind: CpuKind::Shared,
            cpus: 2,
            memory_mb: 1024,
            disk_gb: Some(5),
        },
        security: Security {
            allowed_ports: vec![8080, 8081],
            drop_capabilities: vec!["ALL".to_owned()],
            no_new_privileges: true,
            read_only_rootfs: true,
            seccomp_profile: Some("default".to_owned()),
        },
        max_duration_hours: 4,
        quotas: vec![
            (
                QuotaResource::SessionCreate,
                QuotaLimits {
                    requests_per_window: 20,
                    window_seconds: 3600,
                    burst: Some(5),
                    tokens: None,
                    concurrent: Some(2),
                },
            ),
            (
                QuotaResource::CodeGeneration,
                QuotaLimits {
                    requests_per_window: 100,
                    window_seconds: 3600,
                    burst: Some(15),
                    tokens: Some(100),
                    concurrent: None,
                },
            ),
            (
                QuotaResource::QualityAnalysis,
                QuotaLimits {
                    requests_per_window: 50,
                    window_seconds: 3600,
                    burst: Some(10),
                    tokens: None,
                    concurrent: None,
                },
            ),
        ],
    }
}

fn pro() -> Tier {
    Tier {
        name: TierName::Pro,
        resources: Resources {
            cpu_kind: CpuKind::Dedicated,
            cpus: 4,
            memory_mb: 2048,
            disk_gb: Some(10),
        },
        security: Security {
            allowed_ports: vec![8080, 8081, 8082],
            drop_capabilities: vec!["ALL".to_owned()],
            no_new_privileges: true,
            read_only_rootfs: false,
            seccomp_profile: Some("default".to_owned()),
        },
        max_duration_hours: 8,
        quotas: vec![
            (
                QuotaResource::SessionCreate,
                QuotaLimits {
                    requests_per_window: 100,
                    window_seconds: 3600,
                    burst: Some(20),
                    tokens: None,
                    concurrent: Some(5),
                },
            ),
            (
                QuotaResource::CodeGeneration,
                QuotaLimits {
                    requests_per_window: 1000,
                    window_seconds: 3600,
                    burst: Some(100),
                    tokens: Some(1000),
                    concurrent: None,
                },
            ),
            (
                QuotaResource::QualityAnalysis,
                QuotaLimits {
                    requests_per_window: 500,
                    window_seconds: 3600,
                    burst: Some(50),
                    tokens: None,
                    concurrent: None,
                },
            ),
        ],
    }
}

fn enterprise() -> Tier {
    Tier {
        name: TierName::Enterprise,
        resources: Resources {
            cpu_kind: CpuKind::Dedicated,
            cpus: 8,
            memory_mb: 4096,
            disk_gb: Some(10),
        },
        security: Security {
            allowed_ports: vec![8080, 8081, 8082, 8083],
            drop_capabilities: vec!["ALL".to_owned()],
            no_new_privileges: true,
            read_only_rootfs: false,
            seccomp_profile: Some("default".to_owned()),
        },
        max_duration_hours: 24,
        quotas: vec![
            (
                QuotaResource::SessionCreate,
                QuotaLimits {
                    requests_per_window: u64::MAX,
                    window_seconds: 3600,
                    burst: None,
                    tokens: None,
                    concurrent: Some(20),
                },
            ),
            (
                QuotaResource::CodeGeneration,
                QuotaLimits {
                    requests_per_window: u64::MAX,
                    window_seconds: 3600,
                    burst: None,
                    tokens: None,
                    concurrent: None,
                },
            ),
            (
                QuotaResource::QualityAnalysis,
                QuotaLimits {
                    requests_per_window: u64::MAX,
                    window_seconds: 3600,
                    burst: None,
                    tokens: None,
                    concurrent: None,
                },
            ),
        ],
    }
}

/// Look up the policy for a tier name. Deterministic fallback to `free` is
/// unreachable from `TierName` (a closed enum) — the fallback exists for
/// future tier additions that land in the enum before the table here.
#[must_use]
pub fn policy_for(tier: TierName) -> Tier {
    match tier {
        TierName::Free => free(),
        TierName::Basic => basic(),
        TierName::Pro => pro(),
        TierName::Enterprise => enterprise(),
    }
}

/// Accepts only resources that fit within the defined ceilings (spec §4.3,
/// resolved per §9's open question: these ceilings are extensibility
/// envelopes, not a concrete tier).
#[must_use]
pub fn validate_limits(resources: &Resources) -> bool {
    resources.cpus <= MAX_VALIDATABLE_CPUS
        && resources.memory_mb <= MAX_VALIDATABLE_MEMORY_MB
        && resources.disk_gb.is_none_or(|d| d <= MAX_VALIDATABLE_DISK_GB)
}

/// Two default checks injected into every hardened spec (spec §4.3).
fn default_checks(tier: &Tier) -> Vec<CheckSpec> {
    vec![
        CheckSpec {
            name: "health".to_owned(),
            kind: CheckKind::Http {
                path: "/health".to_owned(),
            },
            interval_secs: if tier.max_duration_hours >= 8 { 10 } else { 15 },
        },
        CheckSpec {
            name: "liveness".to_owned(),
            kind: CheckKind::Script {
                command: "pgrep -f preview-server".to_owned(),
            },
            interval_secs: if tier.max_duration_hours >= 8 { 10 } else { 15 },
        },
    ]
}

/// Apply tier hardening to a machine spec: dropped capabilities,
/// `no_new_privileges`, read-only rootfs, allowed-port filtering, and the
/// two default health checks (spec §4.3). Idempotent: re-applying to an
/// already-hardened spec for the same tier yields the same result.
#[must_use]
pub fn apply_hardening(mut spec: MachineSpec, tier: &Tier) -> MachineSpec {
    spec.drop_capabilities = tier.security.drop_capabilities.clone();
    spec.no_new_privileges = true;
    spec.read_only_rootfs = tier.security.read_only_rootfs;
    spec.seccomp_profile = tier.security.seccomp_profile.clone();
    spec.allowed_ports.retain(|p| tier.security.allowed_ports.contains(p));
    if spec.allowed_ports.is_empty() {
        spec.allowed_ports = tier.security.allowed_ports.clone();
    }
    spec.checks = default_checks(tier);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_ordering_is_monotone_non_decreasing() {
        let tiers = [
            policy_for(TierName::Free),
            policy_for(TierName::Basic),
            policy_for(TierName::Pro),
            policy_for(TierName::Enterprise),
        ];
        for pair in tiers.windows(2) {
            let (lo, hi) = (&pair[0], &pair[1]);
            assert!(hi.resources.cpus >= lo.resources.cpus);
            assert!(hi.resources.memory_mb >= lo.resources.memory_mb);
            assert!(hi.max_duration_hours >= lo.max_duration_hours);
        }
    }

    #[test]
    fn validate_limits_rejects_above_ceiling() {
        assert!(!validate_limits(&Resources {
            cpu_kind: CpuKind::Dedicated,
            cpus: 16,
            memory_mb: 1024,
            disk_gb: None,
        }));
        assert!(validate_limits(&Resources {
            cpu_kind: CpuKind::Dedicated,
            cpus: 8,
            memory_mb: 4096,
            disk_gb: Some(10),
        }));
    }

    #[test]
    fn apply_hardening_is_idempotent() {
        let tier = policy_for(TierName::Pro);
        let spec = sample_spec();
        let once = apply_hardening(spec.clone(), &tier);
        let twice = apply_hardening(once.clone(), &tier);
        assert_eq!(once.drop_capabilities, twice.drop_capabilities);
        assert_eq!(once.allowed_ports, twice.allowed_ports);
        assert_eq!(once.checks.len(), twice.checks.len());
        assert!(twice.no_new_privileges);
    }

    #[test]
    fn apply_hardening_always_sets_no_new_privileges() {
        let tier = policy_for(TierName::Free);
        let spec = apply_hardening(sample_spec(), &tier);
        assert!(spec.no_new_privileges);
    }

    #[test]
    fn apply_hardening_injects_two_default_checks() {
        let tier = policy_for(TierName::Free);
        let spec = apply_hardening(sample_spec(), &tier);
        assert_eq!(spec.checks.len(), 2);
    }

    #[test]
    fn unknown_quota_resource_returns_none() {
        let tier = policy_for(TierName::Free);
        assert!(tier.quota_for(QuotaResource::SessionCreate).is_some());
    }

    fn sample_spec() -> MachineSpec {
        MachineSpec {
            project_id: "proj".to_owned(),
            session_id: "sess".to_owned(),
            image: "registry.example/preview:latest".to_owned(),
            cpu_kind: CpuKind::Shared,
            cpus: 1,
            memory_mb: 512,
            disk_gb: None,
            allowed_ports: vec![8080, 9999],
            drop_capabilities: Vec::new(),
            no_new_privileges: false,
            read_only_rootfs: false,
            seccomp_profile: None,
            checks: Vec::new(),
            tags: std::collections::HashMap::new(),
        }
    }
}

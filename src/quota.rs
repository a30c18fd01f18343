use crate::catalog::PathId;
use crate::error::{MetaError, ResourceType};
use im::OrdMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaCounter {
    Objects,
    StreamPartitions,
    ReservedStorage,
    ReservedThroughput,
}

impl std::fmt::Display for QuotaCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaCounter::Objects => write!(f, "objects"),
            QuotaCounter::StreamPartitions => write!(f, "stream_partitions"),
            QuotaCounter::ReservedStorage => write!(f, "reserved_storage"),
            QuotaCounter::ReservedThroughput => write!(f, "reserved_throughput"),
        }
    }
}

/// Aggregate counters of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DomainInfo {
    pub objects: u64,
    pub stream_partitions: u64,
    pub reserved_storage_bytes: u64,
    pub reserved_throughput_bps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DomainLimits {
    pub max_paths: Option<u64>,
    pub max_stream_partitions: Option<u64>,
    pub max_reserved_storage_bytes: Option<u64>,
}

/// Signed change to a domain's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaDelta {
    pub objects: i64,
    pub partitions: i64,
    pub storage_bytes: i64,
    pub throughput_bps: i64,
}

impl QuotaDelta {
    pub fn objects(objects: i64) -> Self {
        Self {
            objects,
            ..Self::default()
        }
    }

    pub fn negated(&self) -> Self {
        Self {
            objects: -self.objects,
            partitions: -self.partitions,
            storage_bytes: -self.storage_bytes,
            throughput_bps: -self.throughput_bps,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn apply_counter(
    domain_id: PathId,
    counter: QuotaCounter,
    value: u64,
    delta: i64,
) -> Result<u64, MetaError> {
    let applied = if delta >= 0 {
        value.checked_add(delta.unsigned_abs())
    } else {
        value.checked_sub(delta.unsigned_abs())
    };
    applied.ok_or(if delta >= 0 {
        MetaError::QuotaOverflow { domain_id, counter }
    } else {
        MetaError::QuotaUnderflow { domain_id, counter }
    })
}

impl DomainInfo {
    /// Counters after `delta`, or the first counter that would leave `u64`.
    pub fn applied(&self, domain_id: PathId, delta: &QuotaDelta) -> Result<DomainInfo, MetaError> {
        Ok(DomainInfo {
            objects: apply_counter(domain_id, QuotaCounter::Objects, self.objects, delta.objects)?,
            stream_partitions: apply_counter(
                domain_id,
                QuotaCounter::StreamPartitions,
                self.stream_partitions,
                delta.partitions,
            )?,
            reserved_storage_bytes: apply_counter(
                domain_id,
                QuotaCounter::ReservedStorage,
                self.reserved_storage_bytes,
                delta.storage_bytes,
            )?,
            reserved_throughput_bps: apply_counter(
                domain_id,
                QuotaCounter::ReservedThroughput,
                self.reserved_throughput_bps,
                delta.throughput_bps,
            )?,
        })
    }

    /// First limit the counters exceed; only growing counters are judged, so
    /// releasing quota is never blocked by a limit lowered after the fact.
    pub fn exceeded_limit(&self, limits: &DomainLimits, delta: &QuotaDelta) -> Option<QuotaCounter> {
        let over = |limit: Option<u64>, value: u64, change: i64| {
            change > 0 && limit.is_some_and(|limit| value > limit)
        };
        if over(limits.max_paths, self.objects, delta.objects) {
            return Some(QuotaCounter::Objects);
        }
        if over(
            limits.max_stream_partitions,
            self.stream_partitions,
            delta.partitions,
        ) {
            return Some(QuotaCounter::StreamPartitions);
        }
        if over(
            limits.max_reserved_storage_bytes,
            self.reserved_storage_bytes,
            delta.storage_bytes,
        ) {
            return Some(QuotaCounter::ReservedStorage);
        }
        None
    }
}

/// Persisted configuration record of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub limits: DomainLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainEntry {
    pub info: DomainInfo,
    pub limits: DomainLimits,
}

/// Per-domain quota counters.
///
/// The ledger itself is a plain value; atomicity with the journal comes from
/// the operation context mutating a working copy that is only installed
/// after the journal accepted the batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuotaLedger {
    domains: OrdMap<PathId, DomainEntry>,
}

impl QuotaLedger {
    pub fn domain_counters(&self, domain_id: PathId) -> Option<DomainInfo> {
        self.domains.get(&domain_id).map(|entry| entry.info)
    }

    pub fn limits(&self, domain_id: PathId) -> Option<DomainLimits> {
        self.domains.get(&domain_id).map(|entry| entry.limits)
    }

    pub fn domains(&self) -> impl Iterator<Item = (&PathId, &DomainEntry)> {
        self.domains.iter()
    }

    pub(crate) fn register_domain(&mut self, domain_id: PathId, limits: DomainLimits) {
        self.domains.insert(
            domain_id,
            DomainEntry {
                info: DomainInfo::default(),
                limits,
            },
        );
    }

    /// Applies `delta` to every counter or to none of them.
    pub(crate) fn apply_delta(
        &mut self,
        domain_id: PathId,
        delta: &QuotaDelta,
    ) -> Result<DomainInfo, MetaError> {
        let entry = self
            .domains
            .get_mut(&domain_id)
            .ok_or_else(|| MetaError::NotFound {
                resource_type: ResourceType::Domain,
                resource_id: domain_id.to_string(),
            })?;
        let next = entry.info.applied(domain_id, delta)?;
        entry.info = next;
        Ok(next)
    }

    /// Like [`Self::apply_delta`] but also refuses growth past the limits.
    pub(crate) fn reserve(
        &mut self,
        domain_id: PathId,
        delta: &QuotaDelta,
    ) -> Result<Result<DomainInfo, QuotaCounter>, MetaError> {
        let Some(entry) = self.domains.get(&domain_id) else {
            return Err(MetaError::NotFound {
                resource_type: ResourceType::Domain,
                resource_id: domain_id.to_string(),
            });
        };
        let next = entry.info.applied(domain_id, delta)?;
        if let Some(counter) = next.exceeded_limit(&entry.limits, delta) {
            return Ok(Err(counter));
        }
        self.apply_delta(domain_id, delta).map(Ok)
    }

    pub(crate) fn restore_counters(&mut self, domain_id: PathId, info: DomainInfo) {
        let mut entry = self.domains.get(&domain_id).copied().unwrap_or_default();
        entry.info = info;
        self.domains.insert(domain_id, entry);
    }

    pub(crate) fn restore_limits(&mut self, domain_id: PathId, limits: DomainLimits) {
        let mut entry = self.domains.get(&domain_id).copied().unwrap_or_default();
        entry.limits = limits;
        self.domains.insert(domain_id, entry);
    }
}

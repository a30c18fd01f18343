use crate::error::MetaError;
use crate::quota::QuotaDelta;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub write_speed_bytes_per_sec: u64,
    /// Explicit per-group storage cap; when absent the reservation is
    /// derived from write speed and lifetime.
    pub storage_limit_bytes: Option<u64>,
    pub lifetime_seconds: u64,
}

/// Configuration of a partitioned stream group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub partition_count: u32,
    pub partition: PartitionConfig,
    /// Opaque consumer-side configuration carried along with the group.
    #[serde(default)]
    pub sub_config: Vec<u8>,
}

/// Quota a stream group holds in its domain while it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReservation {
    pub partitions: u64,
    pub throughput_bps: u64,
    pub storage_bytes: u64,
}

impl StreamReservation {
    /// Delta charged when the group (one path object) is allocated.
    pub fn allocate_delta(&self) -> Result<QuotaDelta, MetaError> {
        Ok(QuotaDelta {
            objects: 1,
            partitions: to_signed(self.partitions)?,
            storage_bytes: to_signed(self.storage_bytes)?,
            throughput_bps: to_signed(self.throughput_bps)?,
        })
    }

    pub fn release_delta(&self) -> Result<QuotaDelta, MetaError> {
        Ok(self.allocate_delta()?.negated())
    }

    /// Delta moving a group from `self` to `next`, object count untouched.
    pub fn change_to(&self, next: &StreamReservation) -> Result<QuotaDelta, MetaError> {
        Ok(QuotaDelta {
            objects: 0,
            partitions: to_signed(next.partitions)? - to_signed(self.partitions)?,
            storage_bytes: to_signed(next.storage_bytes)? - to_signed(self.storage_bytes)?,
            throughput_bps: to_signed(next.throughput_bps)? - to_signed(self.throughput_bps)?,
        })
    }
}

fn to_signed(value: u64) -> Result<i64, MetaError> {
    i64::try_from(value)
        .map_err(|_| MetaError::Validation(format!("reservation {value} is out of range")))
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.partition_count == 0 {
            return Err("partition_count must be > 0".into());
        }
        if self.partition.write_speed_bytes_per_sec == 0 {
            return Err("write_speed_bytes_per_sec must be > 0".into());
        }
        if self.partition.storage_limit_bytes.is_none() && self.partition.lifetime_seconds == 0 {
            return Err("either storage_limit_bytes or lifetime_seconds must be set".into());
        }
        self.reservation().map(|_| ()).map_err(|e| e.to_string())
    }

    /// Throughput is the sum over partitions; storage is the explicit limit,
    /// else one partition's write speed kept for the configured lifetime.
    pub fn reservation(&self) -> Result<StreamReservation, MetaError> {
        let partitions = u64::from(self.partition_count);
        let speed = self.partition.write_speed_bytes_per_sec;
        let throughput_bps = partitions
            .checked_mul(speed)
            .ok_or_else(|| MetaError::Validation("stream throughput overflows".into()))?;
        let storage_bytes = match self.partition.storage_limit_bytes {
            Some(limit) => limit,
            None => speed
                .checked_mul(self.partition.lifetime_seconds)
                .ok_or_else(|| MetaError::Validation("stream storage overflows".into()))?,
        };
        let reservation = StreamReservation {
            partitions,
            throughput_bps,
            storage_bytes,
        };
        reservation.allocate_delta()?;
        Ok(reservation)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        rmp_serde::to_vec(self).map_err(|e| MetaError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        rmp_serde::from_slice(bytes).map_err(|e| MetaError::Decode(e.to_string()))
    }
}

/// Stream group record owned by a `Stream` path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGroupInfo {
    pub total_partition_count: u32,
    /// Serialized [`ResourceConfig`].
    pub config_blob: Vec<u8>,
    pub alter_version: u64,
    /// Serialized config of an alter that has been proposed but not applied.
    pub pending_alter: Option<Vec<u8>>,
}

impl StreamGroupInfo {
    pub fn new(config: &ResourceConfig) -> Result<Self, MetaError> {
        Ok(Self {
            total_partition_count: config.partition_count,
            config_blob: config.encode()?,
            alter_version: 1,
            pending_alter: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{PartitionConfig, ResourceConfig, StreamGroupInfo};

    fn config(partitions: u32, speed: u64, limit: Option<u64>, lifetime: u64) -> ResourceConfig {
        ResourceConfig {
            partition_count: partitions,
            partition: PartitionConfig {
                write_speed_bytes_per_sec: speed,
                storage_limit_bytes: limit,
                lifetime_seconds: lifetime,
            },
            sub_config: Vec::new(),
        }
    }

    #[test]
    fn storage_derives_from_lifetime_without_explicit_limit() {
        let reservation = config(2, 100, None, 5).reservation().expect("reservation");
        assert_eq!(reservation.partitions, 2);
        assert_eq!(reservation.throughput_bps, 200);
        assert_eq!(reservation.storage_bytes, 500);
    }

    #[test]
    fn explicit_storage_limit_wins() {
        let reservation = config(4, 10, Some(4096), 3600)
            .reservation()
            .expect("reservation");
        assert_eq!(reservation.storage_bytes, 4096);
        assert_eq!(reservation.throughput_bps, 40);
    }

    #[test]
    fn validation_rejects_degenerate_configs() {
        assert!(config(0, 100, None, 5).validate().is_err());
        assert!(config(1, 0, None, 5).validate().is_err());
        assert!(config(1, 100, None, 0).validate().is_err());
        assert!(config(1, u64::MAX, None, 2).validate().is_err());
        assert!(config(1, 100, Some(10), 0).validate().is_ok());
    }

    #[test]
    fn release_is_the_negated_allocation() {
        let reservation = config(2, 100, None, 5).reservation().expect("reservation");
        let alloc = reservation.allocate_delta().expect("alloc");
        let release = reservation.release_delta().expect("release");
        assert_eq!(release.objects, -1);
        assert_eq!(release.storage_bytes, -alloc.storage_bytes);
        assert_eq!(release.partitions, -2);
    }

    #[test]
    fn change_to_reports_signed_difference() {
        let before = config(2, 100, None, 5).reservation().expect("before");
        let after = config(3, 100, None, 2).reservation().expect("after");
        let delta = before.change_to(&after).expect("delta");
        assert_eq!(delta.objects, 0);
        assert_eq!(delta.partitions, 1);
        assert_eq!(delta.throughput_bps, 100);
        assert_eq!(delta.storage_bytes, -300);
    }

    #[test]
    fn group_info_keeps_encoded_config() {
        let cfg = config(2, 100, None, 5);
        let info = StreamGroupInfo::new(&cfg).expect("info");
        assert_eq!(info.total_partition_count, 2);
        assert_eq!(ResourceConfig::decode(&info.config_blob).expect("decode"), cfg);
    }
}

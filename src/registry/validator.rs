//! Group-level configuration checks for caches joining an existing group.

use super::group::CacheGroup;
use crate::config::{CacheConfiguration, ValidationRules};
use crate::error::{ConfigurationConflict, ConflictField};
use crate::types::CacheMode;

/// Rejects caches whose group-level fields disagree with their group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyValidator {
    rules: ValidationRules,
}

impl ConsistencyValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> ValidationRules {
        self.rules
    }

    /// Check a new cache against its group.
    ///
    /// Fields are checked in the order cache mode, atomicity mode, backups,
    /// partitions, affinity; the first mismatch is reported.
    pub fn validate(
        &self,
        group: &CacheGroup,
        config: &CacheConfiguration,
    ) -> Result<(), ConfigurationConflict> {
        let existing_cache = group
            .members
            .iter()
            .next()
            .cloned()
            .unwrap_or_default();
        let conflict = |field: ConflictField, existing: String, requested: String| {
            ConfigurationConflict {
                group: group.name.clone(),
                field,
                existing_cache: existing_cache.clone(),
                existing,
                requested,
            }
        };

        if group.cache_mode != config.cache_mode {
            return Err(conflict(
                ConflictField::CacheMode,
                group.cache_mode.to_string(),
                config.cache_mode.to_string(),
            ));
        }

        if self.rules.check_atomicity && group.atomicity_mode != config.atomicity_mode {
            return Err(conflict(
                ConflictField::AtomicityMode,
                group.atomicity_mode.to_string(),
                config.atomicity_mode.to_string(),
            ));
        }

        if group.cache_mode == CacheMode::Partitioned && group.backups != config.backups {
            return Err(conflict(
                ConflictField::Backups,
                group.backups.to_string(),
                config.backups.to_string(),
            ));
        }

        if self.rules.check_partitions && group.partitions != config.partitions {
            return Err(conflict(
                ConflictField::Partitions,
                group.partitions.to_string(),
                config.partitions.to_string(),
            ));
        }

        if self.rules.check_affinity && group.affinity != config.affinity {
            return Err(conflict(
                ConflictField::Affinity,
                group.affinity.to_string(),
                config.affinity.to_string(),
            ));
        }

        Ok(())
    }
}

//! The data models for datasets

mod datasets;

pub use self::datasets::{
    CONDITION_CLAIM_READY, CONDITION_REFERENCE_CYCLE, CONDITION_SPEC_VALID, CONDITION_SYNCED,
    Dataset, DatasetCondition, DatasetPhase, DatasetResources, DatasetSource, DatasetSpec,
    DatasetStatus, DatasetType, parse_reference_uri,
};

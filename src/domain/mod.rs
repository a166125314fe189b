//! Domain models for network capture orchestration.
//!
//! This module contains the core types shared by the resolver, the
//! synthesizer, the reconciliation loop and the capture runtime. They are
//! independent of any cluster client or transport.

mod filename;
mod request;
mod selector;
mod status;
mod target;
mod workload;

pub use filename::{parse_timestamp, render_timestamp, CaptureFilename, ZERO_TIMESTAMP};
pub use request::{
    CaptureConfiguration, CaptureKey, CaptureOption, CaptureRequest, CaptureSpec, Filters,
    OutputConfiguration, S3Upload, Target,
};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};
pub use status::{CaptureStatus, Condition, ConditionType};
pub use target::{CaptureTarget, CaptureTargetsOnNode, NodeOs};
pub use workload::{
    Container, EnvValue, EnvVar, NodeAffinity, OwnerReference, ResourceList, Resources,
    SecurityContext, Toleration, Volume, VolumeMount, VolumeSource, Workload, WorkloadCondition,
    WorkloadConditionType, WorkloadSpec, WorkloadStatus,
};
